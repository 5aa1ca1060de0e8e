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

//! Retry, deadline and request-metadata helpers shared by the drivers.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tonic::metadata::MetadataMap;
use tonic::Code;

use crate::error::{Error, Result, RetryErrorGroup};
use crate::metrics::ActiveOperation;

/// Routing header attached to every data-plane request.
pub(crate) const REQUEST_PARAMS_HEADER: &str = "x-request-params";

pub(crate) fn request_params(table_name: &str, app_profile_id: &str) -> String {
    if app_profile_id.is_empty() {
        format!("table_name={}", table_name)
    } else {
        format!("table_name={}&app_profile_id={}", table_name, app_profile_id)
    }
}

const BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Exponential backoff with full jitter: each delay is drawn uniformly from
/// zero to the current upper bound, which doubles per attempt up to the cap.
/// One schedule is shared across all attempts of an operation.
pub(crate) struct ExponentialBackoff {
    upper: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            upper: BACKOFF_INITIAL,
        }
    }
}

impl ExponentialBackoff {
    pub fn next_delay(&mut self) -> Duration {
        let upper = self.upper;
        self.upper = (self.upper * 2).min(BACKOFF_CAP);
        let nanos = rand::thread_rng().gen_range(0..=upper.as_nanos() as u64);
        Duration::from_nanos(nanos)
    }
}

/// Layered deadline accounting: the operation budget starts at the first
/// attempt, and each attempt gets `min(attempt_budget, operation_remaining)`.
#[derive(Clone, Copy)]
pub(crate) struct AttemptTimeouts {
    operation: Duration,
    attempt: Duration,
    deadline: Instant,
}

impl AttemptTimeouts {
    /// A missing attempt budget falls back to the operation budget.
    pub fn new(operation: Duration, attempt: Option<Duration>) -> Self {
        Self {
            operation,
            attempt: attempt.unwrap_or(operation),
            deadline: Instant::now() + operation,
        }
    }

    pub fn operation(&self) -> Duration {
        self.operation
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn next_attempt_timeout(&self) -> Duration {
        self.attempt.min(self.remaining())
    }
}

/// Rejects budget combinations that can never make progress. A zero
/// operation budget is *not* rejected here: it fails with DEADLINE-EXCEEDED
/// at call time, before any RPC.
pub(crate) fn validate_timeouts(operation: Duration, attempt: Option<Duration>) -> Result<()> {
    if let Some(attempt) = attempt {
        if attempt > operation {
            return Err(Error::Config(format!(
                "attempt deadline ({:?}) must not exceed the operation deadline ({:?})",
                attempt, operation
            )));
        }
    }
    Ok(())
}

/// Drives a retryable RPC to completion under the layered deadlines.
///
/// The attempt closure receives its per-attempt budget and reports an
/// optional trailing-metadata map for the recorder. Retryable failures are
/// collected and re-attempted after the backoff schedule; everything else
/// propagates. When the operation budget runs out the collected attempt
/// failures are attached to the DEADLINE-EXCEEDED error.
pub(crate) async fn retry_rpc<T, F, Fut>(
    timeouts: AttemptTimeouts,
    retryable_codes: &[Code],
    metrics: &mut ActiveOperation,
    mut attempt_fn: F,
) -> Result<T>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<(T, Option<MetadataMap>)>>,
{
    let mut backoff = ExponentialBackoff::default();
    let mut attempt_errors = RetryErrorGroup::default();
    loop {
        if timeouts.expired() {
            metrics.end(Code::DeadlineExceeded);
            return Err(Error::OperationTimeout {
                timeout: timeouts.operation(),
                attempts: attempt_errors,
            });
        }
        metrics.start_attempt();
        match attempt_fn(timeouts.next_attempt_timeout()).await {
            Ok((value, metadata)) => {
                if let Some(metadata) = metadata {
                    metrics.record_metadata(&metadata);
                }
                metrics.end(Code::Ok);
                return Ok(value);
            }
            Err(err) if err.is_retryable(retryable_codes) => {
                metrics.end_attempt(err.metric_code());
                tracing::debug!(error = %err, "retrying rpc attempt");
                attempt_errors.push(err);
                let delay = backoff.next_delay().min(timeouts.remaining());
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                metrics.end(err.metric_code());
                return Err(err);
            }
        }
    }
}
