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

//! The retryable streaming read driver.
//!
//! [`ReadRowsOperation`] drives one logical read across attempts. Rows flow
//! to the caller through a bounded channel fed by a producer task; the
//! user-facing [`RowStream`] cancels the producer when dropped and enforces
//! an idle timeout.
//!
//! Across all attempts of one operation, emitted row keys are strictly
//! increasing: a watermark tracks the largest delivered key, each retry
//! revises the request to exclude everything at or below it, and rows a
//! (misbehaving) server re-sends below it are dropped rather than emitted.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use cellstore_pb::v1 as pb;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::Code;

use crate::error::{Error, Result, RetryErrorGroup};
use crate::merger::ChunkMerger;
use crate::metrics::ActiveOperation;
use crate::transport::TableTransport;
use crate::util::{AttemptTimeouts, ExponentialBackoff};

/// How long a `RowStream` may sit unpolled before it tears itself down.
pub(crate) const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Rows buffered between the producer task and the caller.
const ROW_BUFFER_SIZE: usize = 16;

/// Rewrites the request's row set to exclude keys at or below `watermark`.
///
/// Point keys <= watermark are dropped; ranges ending at or below it are
/// dropped; ranges starting at or below it are re-anchored to start open at
/// the watermark. An originally empty set (full scan) resumes after the
/// watermark. Returns `None` when nothing remains to read.
pub(crate) fn revise_rowset(rows: Option<pb::RowSet>, watermark: &[u8]) -> Option<pb::RowSet> {
    use pb::row_range::{EndKey, StartKey};

    let rows = match rows {
        Some(rows) if !(rows.row_keys.is_empty() && rows.row_ranges.is_empty()) => rows,
        _ => {
            return Some(pb::RowSet {
                row_keys: vec![],
                row_ranges: vec![pb::RowRange {
                    start_key: Some(StartKey::StartKeyOpen(Bytes::copy_from_slice(watermark))),
                    end_key: None,
                }],
            });
        }
    };

    let row_keys: Vec<Bytes> = rows
        .row_keys
        .into_iter()
        .filter(|key| key.as_ref() > watermark)
        .collect();

    let mut row_ranges = Vec::with_capacity(rows.row_ranges.len());
    for mut range in rows.row_ranges {
        let end = match &range.end_key {
            Some(EndKey::EndKeyClosed(key)) | Some(EndKey::EndKeyOpen(key)) => Some(key.clone()),
            None => None,
        };
        if let Some(end) = end {
            if end.as_ref() <= watermark {
                continue;
            }
        }
        let start_covered = match &range.start_key {
            Some(StartKey::StartKeyClosed(key)) | Some(StartKey::StartKeyOpen(key)) => {
                key.as_ref() <= watermark
            }
            None => true,
        };
        if start_covered {
            range.start_key = Some(StartKey::StartKeyOpen(Bytes::copy_from_slice(watermark)));
        }
        row_ranges.push(range);
    }

    if row_keys.is_empty() && row_ranges.is_empty() {
        None
    } else {
        Some(pb::RowSet {
            row_keys,
            row_ranges,
        })
    }
}

pub(crate) struct ReadRowsOperation {
    transport: Arc<dyn TableTransport>,
    request: pb::ReadRowsRequest,
    timeouts: AttemptTimeouts,
    retryable_codes: Vec<Code>,
    metrics: ActiveOperation,
    /// Largest row key delivered to the caller, across attempts.
    watermark: Option<Bytes>,
    /// Rows the caller may still receive, when the query carries a limit.
    remaining: Option<i64>,
}

impl ReadRowsOperation {
    pub fn new(
        transport: Arc<dyn TableTransport>,
        request: pb::ReadRowsRequest,
        operation_timeout: Duration,
        attempt_timeout: Option<Duration>,
        retryable_codes: Vec<Code>,
        metrics: ActiveOperation,
    ) -> Self {
        let remaining = (request.rows_limit > 0).then_some(request.rows_limit);
        Self {
            transport,
            request,
            timeouts: AttemptTimeouts::new(operation_timeout, attempt_timeout),
            retryable_codes,
            metrics,
            watermark: None,
            remaining,
        }
    }

    /// Spawns the producer and hands back the caller-facing stream.
    pub fn into_stream(self, idle_timeout: Duration) -> RowStream {
        let (tx, rx) = mpsc::channel(ROW_BUFFER_SIZE);
        let producer = tokio::spawn(self.run(tx));
        RowStream {
            rx,
            producer,
            idle_timeout,
            last_poll: Instant::now(),
            done: false,
        }
    }

    async fn run(mut self, tx: mpsc::Sender<Result<crate::row::Row>>) {
        let mut backoff = ExponentialBackoff::default();
        let mut attempt_errors = RetryErrorGroup::default();
        loop {
            if self.timeouts.expired() {
                self.metrics.end(Code::DeadlineExceeded);
                let _ = tx
                    .send(Err(Error::OperationTimeout {
                        timeout: self.timeouts.operation(),
                        attempts: std::mem::take(&mut attempt_errors),
                    }))
                    .await;
                return;
            }
            self.metrics.start_attempt();
            match self.attempt(&tx).await {
                Ok(()) => {
                    self.metrics.end(Code::Ok);
                    return;
                }
                Err(err) if err.is_retryable(&self.retryable_codes) => {
                    self.metrics.end_attempt(err.metric_code());
                    tracing::debug!(error = %err, "retrying read_rows attempt");
                    attempt_errors.push(err);
                    let delay = backoff.next_delay().min(self.timeouts.remaining());
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.metrics.end(err.metric_code());
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
    }

    /// One attempt: revise the request past the watermark, re-derive the
    /// remaining row limit, open the stream and pump it through a fresh
    /// merger, emitting only rows beyond the watermark.
    async fn attempt(&mut self, tx: &mpsc::Sender<Result<crate::row::Row>>) -> Result<()> {
        if let Some(watermark) = self.watermark.clone() {
            match revise_rowset(self.request.rows.take(), &watermark) {
                Some(rows) => self.request.rows = Some(rows),
                // Every requested key and range is already covered.
                None => return Ok(()),
            }
        }
        if let Some(remaining) = self.remaining {
            if remaining <= 0 {
                return Ok(());
            }
            self.request.rows_limit = remaining;
        }

        let timeout = self.timeouts.next_attempt_timeout();
        let mut stream = self
            .transport
            .read_rows(self.request.clone(), timeout)
            .await?;
        let mut merger = ChunkMerger::new(self.remaining);
        let mut saw_response = false;

        while let Some(response) = stream.next().await {
            let response = response.map_err(Error::from)?;
            if !saw_response {
                saw_response = true;
                self.metrics.attempt_first_response();
            }
            if !response.last_scanned_row_key.is_empty() {
                let scanned = response.last_scanned_row_key.clone();
                merger.handle_last_scanned(scanned.clone())?;
                if self.watermark.as_ref().map_or(true, |w| scanned > *w) {
                    self.watermark = Some(scanned);
                }
            }
            for chunk in response.chunks {
                let Some(row) = merger.handle_chunk(chunk)? else {
                    continue;
                };
                // Rows at or below the watermark were already delivered by
                // an earlier attempt; drop them instead of re-emitting.
                if self.watermark.as_ref().map_or(false, |w| row.key() <= w) {
                    continue;
                }
                self.watermark = Some(row.key().clone());
                if tx.send(Ok(row)).await.is_err() {
                    return Err(Error::Cancelled);
                }
                if let Some(remaining) = &mut self.remaining {
                    *remaining -= 1;
                    if *remaining == 0 {
                        return Ok(());
                    }
                }
            }
        }
        merger.finish()?;
        Ok(())
    }
}

/// A lazy, forward-only, non-restartable stream of rows.
///
/// Dropping it cancels the underlying operation; cancelling twice is a
/// no-op. A stream left unpolled for longer than its idle timeout fails
/// with [`Error::IdleTimeout`] and tears the operation down.
pub struct RowStream {
    rx: mpsc::Receiver<Result<crate::row::Row>>,
    producer: JoinHandle<()>,
    idle_timeout: Duration,
    last_poll: Instant,
    done: bool,
}

impl RowStream {
    /// A stream that is already exhausted; used when the request can be
    /// answered without an RPC.
    pub(crate) fn empty() -> RowStream {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        RowStream {
            rx,
            producer: tokio::spawn(async {}),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            last_poll: Instant::now(),
            done: false,
        }
    }

    /// Stops consumption and cancels the underlying RPC. Idempotent.
    pub fn cancel(&mut self) {
        self.producer.abort();
        self.rx.close();
        self.done = true;
    }
}

impl Stream for RowStream {
    type Item = Result<crate::row::Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.last_poll.elapsed() > this.idle_timeout {
            let idle = this.idle_timeout;
            this.cancel();
            return Poll::Ready(Some(Err(Error::IdleTimeout(idle))));
        }
        this.last_poll = Instant::now();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(row))) => Poll::Ready(Some(Ok(row))),
            Poll::Ready(Some(Err(err))) => {
                // Errors are terminal; the producer has already stopped.
                this.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}
