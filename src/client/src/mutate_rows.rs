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

//! The partial-progress bulk mutation driver.
//!
//! [`MutateRowsOperation`] executes a batch of mutation entries, tracking a
//! live/terminal flag and an error history per entry. Each attempt re-sends
//! only the live subset; per-entry statuses from the response stream clear
//! the history on success, extend it on retryable failure of an idempotent
//! entry, and finalize the entry otherwise. An attempt that leaves live
//! entries behind schedules another one until the deadline runs out.
//!
//! Every entry is finalized exactly once, and its terminal callback fires
//! in the order the service reported terminal results.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use cellstore_pb::v1 as pb;
use futures::StreamExt;
use tonic::Code;

use crate::error::{
    Error, FailedMutationError, MutationGroupError, Result, RetryErrorGroup,
};
use crate::metrics::ActiveOperation;
use crate::mutation::MutationEntry;
use crate::transport::TableTransport;
use crate::util::{AttemptTimeouts, ExponentialBackoff};

/// Invoked once per entry when it reaches a terminal state; `None` cause
/// means success.
pub type TerminalCallback = Box<dyn FnMut(&MutationEntry, Option<&Error>) + Send>;

enum AttemptOutcome {
    /// Every entry is terminal.
    Complete,
    /// Live retryable entries remain; another attempt is needed.
    Incomplete,
}

pub(crate) struct MutateRowsOperation {
    transport: Arc<dyn TableTransport>,
    table_name: String,
    app_profile_id: String,
    timeouts: AttemptTimeouts,
    retryable_codes: Vec<Code>,
    entries: Vec<MutationEntry>,
    live: Vec<bool>,
    errors: Vec<Vec<Error>>,
    on_terminal: Option<TerminalCallback>,
    metrics: ActiveOperation,
}

impl MutateRowsOperation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn TableTransport>,
        table_name: String,
        app_profile_id: String,
        entries: Vec<MutationEntry>,
        operation_timeout: Duration,
        attempt_timeout: Option<Duration>,
        retryable_codes: Vec<Code>,
        on_terminal: Option<TerminalCallback>,
        metrics: ActiveOperation,
    ) -> Self {
        let count = entries.len();
        Self {
            transport,
            table_name,
            app_profile_id,
            timeouts: AttemptTimeouts::new(operation_timeout, attempt_timeout),
            retryable_codes,
            entries,
            live: vec![true; count],
            errors: vec![Vec::new(); count],
            on_terminal,
            metrics,
        }
    }

    /// Runs the operation to completion. Succeeds iff every entry did.
    pub async fn run(mut self) -> Result<()> {
        let total = self.entries.len();
        if total == 0 {
            self.metrics.end(Code::Ok);
            return Ok(());
        }
        let mut backoff = ExponentialBackoff::default();
        loop {
            if self.timeouts.expired() {
                let timeout_err = Error::OperationTimeout {
                    timeout: self.timeouts.operation(),
                    attempts: RetryErrorGroup::default(),
                };
                self.finalize_all_live(timeout_err);
                break;
            }
            self.metrics.start_attempt();
            match self.attempt().await {
                Ok(AttemptOutcome::Complete) => {
                    self.metrics.end_attempt(Code::Ok);
                    break;
                }
                Ok(AttemptOutcome::Incomplete) => {
                    self.metrics.end_attempt(Code::Ok);
                    let delay = backoff.next_delay().min(self.timeouts.remaining());
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_retryable(&self.retryable_codes) => {
                    self.metrics.end_attempt(err.metric_code());
                    tracing::debug!(error = %err, "retrying mutate_rows attempt");
                    // Every live idempotent entry observed the failure; live
                    // non-idempotent entries become terminal with it.
                    for idx in 0..total {
                        if !self.live[idx] {
                            continue;
                        }
                        if self.entries[idx].is_idempotent() {
                            self.errors[idx].push(err.clone());
                        } else {
                            self.finalize_entry(idx, Some(err.clone()));
                        }
                    }
                    if !self.live.iter().any(|live| *live) {
                        break;
                    }
                    let delay = backoff.next_delay().min(self.timeouts.remaining());
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.metrics.end_attempt(err.metric_code());
                    self.finalize_all_live(err);
                    break;
                }
            }
        }

        let mut failures = Vec::new();
        for idx in 0..total {
            if self.errors[idx].is_empty() {
                continue;
            }
            let cause = Error::from_attempt_errors(mem::take(&mut self.errors[idx]));
            failures.push(FailedMutationError::new(
                Some(idx),
                self.entries[idx].clone(),
                cause,
            ));
        }
        if failures.is_empty() {
            self.metrics.end(Code::Ok);
            Ok(())
        } else {
            let final_code = failures
                .last()
                .map(|f| f.cause.metric_code())
                .unwrap_or(Code::Unknown);
            self.metrics.end(final_code);
            Err(Error::MutationGroup(MutationGroupError {
                failures,
                total_entries: total,
            }))
        }
    }

    /// One RPC over the live subset, with a sub-index to global-index map.
    async fn attempt(&mut self) -> Result<AttemptOutcome> {
        let index_map: Vec<usize> = (0..self.entries.len())
            .filter(|idx| self.live[*idx])
            .collect();
        let request = pb::MutateRowsRequest {
            table_name: self.table_name.clone(),
            app_profile_id: self.app_profile_id.clone(),
            entries: index_map
                .iter()
                .map(|&global| self.entries[global].to_pb())
                .collect(),
        };
        let timeout = self.timeouts.next_attempt_timeout();
        let mut stream = self.transport.mutate_rows(request, timeout).await?;
        while let Some(response) = stream.next().await {
            let response = response.map_err(Error::from)?;
            for entry_result in response.entries {
                let global = usize::try_from(entry_result.index)
                    .ok()
                    .and_then(|sub| index_map.get(sub).copied())
                    .ok_or_else(|| {
                        Error::Rpc(tonic::Status::internal(format!(
                            "service reported status for unknown entry index {}",
                            entry_result.index
                        )))
                    })?;
                if !self.live[global] {
                    continue;
                }
                let status = entry_result.status.unwrap_or_default();
                if status.code == 0 {
                    self.errors[global].clear();
                    self.finalize_entry(global, None);
                    continue;
                }
                let err = Error::from(status);
                if err.is_retryable(&self.retryable_codes) && self.entries[global].is_idempotent()
                {
                    self.errors[global].push(err);
                } else {
                    self.finalize_entry(global, Some(err));
                }
            }
        }
        if self.live.iter().any(|live| *live) {
            Ok(AttemptOutcome::Incomplete)
        } else {
            Ok(AttemptOutcome::Complete)
        }
    }

    /// Moves one entry to terminal and fires its callback exactly once.
    fn finalize_entry(&mut self, idx: usize, error: Option<Error>) {
        if !self.live[idx] {
            return;
        }
        self.live[idx] = false;
        if let Some(err) = error {
            self.errors[idx].push(err);
            if let Some(callback) = self.on_terminal.as_mut() {
                callback(&self.entries[idx], self.errors[idx].last());
            }
        } else if let Some(callback) = self.on_terminal.as_mut() {
            callback(&self.entries[idx], None);
        }
    }

    fn finalize_all_live(&mut self, error: Error) {
        for idx in 0..self.entries.len() {
            if self.live[idx] {
                self.finalize_entry(idx, Some(error.clone()));
            }
        }
    }
}

impl Drop for MutateRowsOperation {
    fn drop(&mut self) {
        // A dropped future is a cancelled operation: still-live entries
        // become terminal with a cancelled cause and callbacks still fire.
        if self.live.iter().any(|live| *live) {
            self.finalize_all_live(Error::Cancelled);
        }
    }
}
