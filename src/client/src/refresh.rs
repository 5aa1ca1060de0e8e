// Copyright 2022 Singularity Data
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Periodic, jittered channel refresh.
//!
//! The service closes channels after roughly an hour, so one task per pool
//! slot replaces its channel on a random interval drawn from
//! `[refresh_min, refresh_max]`, pre-warming the replacement before the
//! swap and letting the old channel drain for a grace period.
//! `refresh_max + grace_period` must stay below the server-side limit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::pool::{ChannelPool, TrackedChannel};

#[derive(Clone, Debug)]
pub struct RefreshConfig {
    pub refresh_min: Duration,
    pub refresh_max: Duration,
    pub grace_period: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            refresh_min: Duration::from_secs(35 * 60),
            refresh_max: Duration::from_secs(45 * 60),
            grace_period: Duration::from_secs(10 * 60),
        }
    }
}

/// Pre-warms a channel by pinging every registered instance on it.
#[async_trait]
pub(crate) trait ChannelWarmer: Send + Sync + 'static {
    async fn warm(&self, channel: &TrackedChannel);
}

/// Spawns one refresh task per current pool slot. The tasks observe the
/// shutdown signal at every sleep and exit promptly when it fires.
pub(crate) fn start_refresh_tasks(
    pool: Arc<ChannelPool>,
    warmer: Arc<dyn ChannelWarmer>,
    config: RefreshConfig,
    init_time: Instant,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..pool.size())
        .map(|index| {
            tokio::spawn(refresh_loop(
                pool.clone(),
                warmer.clone(),
                config.clone(),
                init_time,
                shutdown.clone(),
                index,
            ))
        })
        .collect()
}

fn jittered_interval(config: &RefreshConfig) -> Duration {
    let min = config.refresh_min.min(config.refresh_max);
    let max = config.refresh_max.max(config.refresh_min);
    if min == max {
        return min;
    }
    Duration::from_secs_f64(rand::thread_rng().gen_range(min.as_secs_f64()..=max.as_secs_f64()))
}

async fn refresh_loop(
    pool: Arc<ChannelPool>,
    warmer: Arc<dyn ChannelWarmer>,
    config: RefreshConfig,
    init_time: Instant,
    mut shutdown: watch::Receiver<bool>,
    index: usize,
) {
    // The first cycle is anchored to client init, not task spawn.
    let first_deadline = init_time + jittered_interval(&config);
    let mut next_sleep = first_deadline.saturating_duration_since(Instant::now());
    if !next_sleep.is_zero() {
        // Warm the channel we already have while waiting for the first
        // refresh.
        if let Some(channel) = pool.get(index) {
            warmer.warm(&channel).await;
        }
    }
    loop {
        tokio::select! {
            _ = tokio::time::sleep(next_sleep) => {}
            _ = shutdown.changed() => {
                tracing::debug!(index, "channel refresh task shutting down");
                return;
            }
        }
        let cycle_started = Instant::now();
        match pool.create_channel() {
            Ok(new_channel) => {
                warmer.warm(&new_channel).await;
                if let Err(err) = pool.replace(index, new_channel, config.grace_period) {
                    // The slot disappeared (pool shrunk); nothing to manage.
                    tracing::warn!(index, error = %err, "stopping refresh task");
                    return;
                }
                tracing::debug!(index, "refreshed pooled channel");
            }
            Err(err) => {
                tracing::warn!(index, error = %err, "failed to create replacement channel");
            }
        }
        // Keep the cadence: subtract the time the refresh itself took.
        next_sleep = jittered_interval(&config).saturating_sub(cycle_started.elapsed());
    }
}
