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

//! Round-robin channel pool with atomic replacement and RPC tracking.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cellstore_pb::v1::table_data_client::TableDataClient;
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tonic::transport::Channel;

use crate::error::{Error, Result};

/// A pooled channel plus its cached stub and in-flight RPC accounting.
///
/// The stub lives with the channel, so swapping a pool slot atomically
/// invalidates any cached stub for the channel it replaces.
pub struct TrackedChannel {
    channel: Channel,
    stub: TableDataClient,
    active_rpcs: AtomicI64,
    /// High-water mark of concurrently active RPCs since the last drain.
    max_active_rpcs: AtomicI64,
}

impl TrackedChannel {
    pub fn new(channel: Channel) -> Self {
        let stub = TableDataClient::new(channel.clone());
        Self {
            channel,
            stub,
            active_rpcs: AtomicI64::new(0),
            max_active_rpcs: AtomicI64::new(0),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// A clone of the cached stub; cheap, shares the underlying channel.
    pub fn stub(&self) -> TableDataClient {
        self.stub.clone()
    }

    /// Opens an RPC tracking scope. The count drops when the scope does,
    /// whether the RPC completed or was cancelled.
    pub fn track_rpc(self: &Arc<Self>) -> RpcScope {
        let now_active = self.active_rpcs.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_rpcs.fetch_max(now_active, Ordering::SeqCst);
        RpcScope {
            channel: self.clone(),
        }
    }

    pub fn active_rpcs(&self) -> i64 {
        self.active_rpcs.load(Ordering::SeqCst)
    }

    /// Returns the high-water mark and re-seeds it with the current load.
    pub fn get_and_reset_max_active_rpcs(&self) -> i64 {
        self.max_active_rpcs
            .swap(self.active_rpcs.load(Ordering::SeqCst), Ordering::SeqCst)
    }
}

/// Guard for one tracked RPC on one channel.
pub struct RpcScope {
    channel: Arc<TrackedChannel>,
}

impl Drop for RpcScope {
    fn drop(&mut self) {
        self.channel.active_rpcs.fetch_sub(1, Ordering::SeqCst);
    }
}

pub type ChannelFactory = Arc<dyn Fn() -> Result<Channel> + Send + Sync>;

/// A fixed-size ring of channels. `next` round-robins; the lifecycle
/// manager and the optional sizer are the only writers.
pub struct ChannelPool {
    channels: RwLock<Vec<Arc<TrackedChannel>>>,
    next_idx: AtomicUsize,
    factory: ChannelFactory,
}

impl ChannelPool {
    pub fn new(pool_size: usize, factory: ChannelFactory) -> Result<Self> {
        if pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".to_string()));
        }
        let channels = (0..pool_size)
            .map(|_| Ok(Arc::new(TrackedChannel::new(factory()?))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            channels: RwLock::new(channels),
            next_idx: AtomicUsize::new(0),
            factory,
        })
    }

    pub fn size(&self) -> usize {
        self.channels.read().len()
    }

    /// Round-robin pick. RPCs that captured a channel before a `replace`
    /// keep using it; later picks observe the replacement.
    pub fn next(&self) -> Arc<TrackedChannel> {
        let channels = self.channels.read();
        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) % channels.len();
        channels[idx].clone()
    }

    pub fn get(&self, index: usize) -> Option<Arc<TrackedChannel>> {
        self.channels.read().get(index).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<TrackedChannel>> {
        self.channels.read().clone()
    }

    pub fn create_channel(&self) -> Result<TrackedChannel> {
        Ok(TrackedChannel::new((self.factory)()?))
    }

    /// Installs `new_channel` at `index` and releases the pool's reference
    /// to the old one after `grace`. RPCs already running on the old channel
    /// hold their own references and run to completion.
    pub fn replace(
        &self,
        index: usize,
        new_channel: TrackedChannel,
        grace: Duration,
    ) -> Result<()> {
        let old = {
            let mut channels = self.channels.write();
            let len = channels.len();
            let slot = channels.get_mut(index).ok_or_else(|| {
                Error::Config(format!(
                    "channel index {} out of bounds for pool of {}",
                    index, len
                ))
            })?;
            std::mem::replace(slot, Arc::new(new_channel))
        };
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            drop(old);
        });
        Ok(())
    }

    pub fn append_channel(&self, channel: TrackedChannel) {
        self.channels.write().push(Arc::new(channel));
    }

    /// Shrinks the pool by one, never below a single channel.
    pub fn remove_channel_at_end(&self) -> Option<Arc<TrackedChannel>> {
        let mut channels = self.channels.write();
        if channels.len() <= 1 {
            return None;
        }
        channels.pop()
    }

    /// Sums and resets every channel's high-water mark; an estimate of the
    /// peak concurrent RPCs since the previous drain.
    pub fn drain_and_reset_max_active(&self) -> i64 {
        self.channels
            .read()
            .iter()
            .map(|c| c.get_and_reset_max_active_rpcs())
            .sum()
    }
}

#[derive(Clone, Debug)]
pub struct PoolSizerConfig {
    pub interval: Duration,
    pub min_channels: usize,
    pub max_channels: usize,
    pub max_rpcs_per_channel: usize,
    /// Most channels added or removed in a single resize event.
    pub max_resize_delta: usize,
}

impl Default for PoolSizerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            min_channels: 1,
            max_channels: 10,
            max_rpcs_per_channel: 100,
            max_resize_delta: 2,
        }
    }
}

/// Optional policy that periodically resizes the pool from observed load.
/// Talks to the pool only through its narrow append/remove/drain API.
pub struct PoolSizer {
    pool: Arc<ChannelPool>,
    config: PoolSizerConfig,
}

impl PoolSizer {
    pub fn new(pool: Arc<ChannelPool>, config: PoolSizerConfig) -> Self {
        Self { pool, config }
    }

    /// Spawns the resize loop. Send on the returned channel to stop it.
    pub fn start(self) -> (JoinHandle<()>, UnboundedSender<()>) {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel();
        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("pool sizer is shutting down");
                        return;
                    }
                }
                let (added, removed) = self.attempt_resize();
                if added > 0 || removed > 0 {
                    tracing::info!(added, removed, size = self.pool.size(), "resized channel pool");
                }
            }
        });
        (join_handle, shutdown_tx)
    }

    /// One resize step: estimate the peak, compute the clamped target and
    /// move toward it by at most `max_resize_delta` channels.
    pub fn attempt_resize(&self) -> (usize, usize) {
        let peak = self.pool.drain_and_reset_max_active().max(0) as f64;
        let target = (peak / self.config.max_rpcs_per_channel.max(1) as f64).round() as usize;
        let target = target.clamp(self.config.min_channels, self.config.max_channels);
        let current = self.pool.size();

        let mut added = 0;
        let mut removed = 0;
        if target > current {
            let grow_by = (target - current).min(self.config.max_resize_delta);
            for _ in 0..grow_by {
                match self.pool.create_channel() {
                    Ok(channel) => {
                        self.pool.append_channel(channel);
                        added += 1;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to grow channel pool");
                        break;
                    }
                }
            }
        } else if target < current {
            let shrink_by = (current - target).min(self.config.max_resize_delta);
            for _ in 0..shrink_by {
                if self.pool.remove_channel_at_end().is_none() {
                    break;
                }
                removed += 1;
            }
        }
        (added, removed)
    }
}
