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

//! Background-flushing mutation batcher.
//!
//! [`MutationsBatcher`] buffers appended entries and turns them into bulk
//! submissions on a timer, on reaching the count/byte thresholds, or on an
//! explicit `flush`. A flush atomically takes the staged buffer, partitions
//! it through the [`FlowController`] and submits each admitted sub-batch
//! concurrently. `append`/`flush`/`close` never propagate per-entry
//! failures; the most recent ones are observable through `drain_errors`
//! (bounded, FIFO, lossy at the head). Callers needing synchronous error
//! handling use `Table::bulk_mutate_rows` directly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tonic::Code;

use crate::error::{Error, FailedMutationError, Result, MUTATION_RETRYABLE};
use crate::flow_control::FlowController;
use crate::metrics::{MetricsController, OperationType};
use crate::mutate_rows::MutateRowsOperation;
use crate::mutation::MutationEntry;
use crate::transport::TableTransport;

/// Most recent terminal failures kept for inspection; older ones are shed.
const ERROR_QUEUE_LIMIT: usize = 100;

#[derive(Clone, Debug)]
pub struct BatcherConfig {
    /// Maximum time between flushes.
    pub flush_every: Duration,
    /// Flush when this many entries are staged.
    pub flush_at_count: usize,
    /// Flush when this many bytes are staged.
    pub flush_at_bytes: usize,
    /// Flow-controller cap on in-flight entries.
    pub max_inflight_entries: usize,
    /// Flow-controller cap on in-flight bytes. Also the hard per-entry
    /// ceiling: a single entry above it is rejected at `append`.
    pub max_inflight_bytes: usize,
    pub operation_timeout: Duration,
    pub attempt_timeout: Option<Duration>,
    pub retryable_codes: Vec<Code>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            flush_every: Duration::from_secs(5),
            flush_at_count: 100,
            flush_at_bytes: 20 * 1024 * 1024,
            max_inflight_entries: 1000,
            max_inflight_bytes: 100 * 1024 * 1024,
            operation_timeout: Duration::from_secs(60),
            attempt_timeout: Some(Duration::from_secs(60)),
            retryable_codes: MUTATION_RETRYABLE.to_vec(),
        }
    }
}

#[derive(Default)]
struct Staged {
    entries: Vec<MutationEntry>,
    bytes: usize,
}

struct BatcherShared {
    transport: Arc<dyn TableTransport>,
    metrics: MetricsController,
    table_name: String,
    app_profile_id: String,
    config: BatcherConfig,
    staged: Mutex<Staged>,
    /// Signalled whenever a flush drains the staged buffer.
    staged_drained: Notify,
    flow: Arc<FlowController>,
    errors: Mutex<VecDeque<FailedMutationError>>,
    closed: AtomicBool,
    flush_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BatcherShared {
    /// Atomically moves the staged buffer into a new flush task. Returns a
    /// receiver resolving when that flush is terminal for every entry it
    /// took, or `None` when nothing was staged.
    fn schedule_flush(self: &Arc<Self>) -> Option<oneshot::Receiver<()>> {
        let batch = {
            let mut staged = self.staged.lock();
            if staged.entries.is_empty() {
                return None;
            }
            staged.bytes = 0;
            std::mem::take(&mut staged.entries)
        };
        self.staged_drained.notify_waiters();

        let (done_tx, done_rx) = oneshot::channel();
        let shared = self.clone();
        let handle = tokio::spawn(async move {
            shared.run_flush(batch).await;
            let _ = done_tx.send(());
        });
        let mut tasks = self.flush_tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        Some(done_rx)
    }

    async fn run_flush(self: &Arc<Self>, batch: Vec<MutationEntry>) {
        let mut admitted = std::pin::pin!(self.flow.admit(batch));
        let mut submissions = Vec::new();
        let mut wait_started = Instant::now();
        while let Some(sub_batch) = admitted.next().await {
            let throttled_for = wait_started.elapsed();
            let shared = self.clone();
            submissions.push(tokio::spawn(async move {
                shared.submit(sub_batch, throttled_for).await;
            }));
            wait_started = Instant::now();
        }
        for submission in submissions {
            let _ = submission.await;
        }
    }

    /// Submits one admitted sub-batch and returns its flow credit.
    async fn submit(self: Arc<Self>, sub_batch: Vec<MutationEntry>, throttled_for: Duration) {
        let mut metrics = self
            .metrics
            .create_operation(OperationType::BulkMutateRows, false);
        metrics.add_flow_throttling(throttled_for);
        let operation = MutateRowsOperation::new(
            self.transport.clone(),
            self.table_name.clone(),
            self.app_profile_id.clone(),
            sub_batch.clone(),
            self.config.operation_timeout,
            self.config.attempt_timeout,
            self.config.retryable_codes.clone(),
            None,
            metrics,
        );
        let result = operation.run().await;
        self.flow.release(&sub_batch);
        match result {
            Ok(()) => {}
            Err(Error::MutationGroup(group)) => self.record_failures(group.failures),
            Err(other) => {
                tracing::warn!(error = %other, "background flush failed");
            }
        }
    }

    fn record_failures(&self, failures: Vec<FailedMutationError>) {
        let mut errors = self.errors.lock();
        for mut failure in failures {
            // Sub-batch indices are meaningless to the caller by now.
            failure.index = None;
            errors.push_back(failure);
        }
        while errors.len() > ERROR_QUEUE_LIMIT {
            errors.pop_front();
        }
    }

    fn staged_has_room(&self, staged: &Staged) -> bool {
        staged.entries.len() < self.config.flush_at_count.max(1)
            && staged.bytes < self.config.flush_at_bytes.max(1)
    }
}

/// User-facing append-only sink. Obtained from `Table::mutations_batcher`.
pub struct MutationsBatcher {
    shared: Arc<BatcherShared>,
    timer: Option<(JoinHandle<()>, UnboundedSender<()>)>,
}

impl MutationsBatcher {
    pub(crate) fn new(
        transport: Arc<dyn TableTransport>,
        metrics: MetricsController,
        table_name: String,
        app_profile_id: String,
        config: BatcherConfig,
    ) -> Self {
        let flow = Arc::new(FlowController::new(
            config.max_inflight_entries,
            config.max_inflight_bytes,
        ));
        let shared = Arc::new(BatcherShared {
            transport,
            metrics,
            table_name,
            app_profile_id,
            config,
            staged: Mutex::new(Staged::default()),
            staged_drained: Notify::new(),
            flow,
            errors: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            flush_tasks: Mutex::new(Vec::new()),
        });
        let timer = Self::start_flush_timer(shared.clone());
        Self {
            shared,
            timer: Some(timer),
        }
    }

    fn start_flush_timer(shared: Arc<BatcherShared>) -> (JoinHandle<()>, UnboundedSender<()>) {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel();
        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(shared.config.flush_every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.recv() => {
                        return;
                    }
                }
                let _ = shared.schedule_flush();
            }
        });
        (join_handle, shutdown_tx)
    }

    /// Stages one entry. O(1); suspends while the staged buffer is full
    /// with a flush draining it. Fails after `close`, or when the entry
    /// alone exceeds the hard byte cap.
    pub async fn append(&self, entry: MutationEntry) -> Result<()> {
        let shared = &self.shared;
        let size = entry.byte_size();
        if size > shared.config.max_inflight_bytes {
            return Err(Error::EntryTooLarge {
                size,
                limit: shared.config.max_inflight_bytes,
            });
        }
        let mut entry = Some(entry);
        loop {
            if shared.closed.load(Ordering::SeqCst) {
                return Err(Error::BatcherClosed);
            }
            // Register as a drain waiter up front so a flush finishing
            // between the capacity check and the await cannot be missed.
            let drained = shared.staged_drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            let reached_threshold = {
                let mut staged = shared.staged.lock();
                if shared.staged_has_room(&staged) {
                    staged.entries.push(entry.take().expect("entry staged twice"));
                    staged.bytes += size;
                    Some(!shared.staged_has_room(&staged))
                } else {
                    None
                }
            };
            match reached_threshold {
                Some(true) => {
                    let _ = shared.schedule_flush();
                    return Ok(());
                }
                Some(false) => return Ok(()),
                None => {
                    // Buffer is at capacity: kick a flush and wait for the
                    // drain (or for close).
                    let _ = shared.schedule_flush();
                    drained.await;
                }
            }
        }
    }

    /// Flushes the currently staged entries and waits for that flush (and
    /// only that flush) to be terminal for every entry it took. Entries
    /// appended concurrently are not blocked and not waited for.
    pub async fn flush(&self) -> Result<()> {
        if let Some(done) = self.shared.schedule_flush() {
            let _ = done.await;
        }
        Ok(())
    }

    /// Flushes what remains, waits for every in-flight flush, then refuses
    /// further appends.
    pub async fn close(mut self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        // Wake blocked appenders so they observe the closed flag.
        self.shared.staged_drained.notify_waiters();
        if let Some((handle, shutdown)) = self.timer.take() {
            let _ = shutdown.send(());
            let _ = handle.await;
        }
        let _ = self.shared.schedule_flush();
        loop {
            let tasks: Vec<JoinHandle<()>> =
                std::mem::take(&mut *self.shared.flush_tasks.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                let _ = task.await;
            }
        }
        Ok(())
    }

    /// Takes the queued terminal failures, oldest first.
    pub fn drain_errors(&self) -> Vec<FailedMutationError> {
        self.shared.errors.lock().drain(..).collect()
    }

    pub fn error_count(&self) -> usize {
        self.shared.errors.lock().len()
    }
}

impl Drop for MutationsBatcher {
    fn drop(&mut self) {
        if let Some((handle, shutdown)) = self.timer.take() {
            let _ = shutdown.send(());
            handle.abort();
        }
        let staged = self.shared.staged.lock().entries.len();
        if !self.shared.closed.load(Ordering::SeqCst) && staged > 0 {
            tracing::warn!(
                staged,
                "mutations batcher dropped without close; staged entries discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use cellstore_pb::v1 as pb;

    use super::*;
    use crate::mutation::set_cell;
    use crate::transport::ResponseStream;

    fn entry(key: &[u8]) -> MutationEntry {
        MutationEntry::new(
            Bytes::copy_from_slice(key),
            vec![set_cell("f", &b"q"[..], &b"v"[..], Some(1))],
        )
        .unwrap()
    }

    /// Acknowledges every entry, optionally failing them all instead, and
    /// records the size of each submission.
    struct AckTransport {
        request_sizes: StdMutex<Vec<usize>>,
        fail_with: Option<Code>,
    }

    impl AckTransport {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                request_sizes: StdMutex::new(vec![]),
                fail_with: None,
            })
        }

        fn failing(code: Code) -> Arc<Self> {
            Arc::new(Self {
                request_sizes: StdMutex::new(vec![]),
                fail_with: Some(code),
            })
        }

        fn sizes(&self) -> Vec<usize> {
            self.request_sizes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TableTransport for AckTransport {
        async fn read_rows(
            &self,
            _request: pb::ReadRowsRequest,
            _timeout: Duration,
        ) -> Result<ResponseStream<pb::ReadRowsResponse>> {
            unimplemented!()
        }

        async fn sample_row_keys(
            &self,
            _request: pb::SampleRowKeysRequest,
            _timeout: Duration,
        ) -> Result<ResponseStream<pb::SampleRowKeysResponse>> {
            unimplemented!()
        }

        async fn mutate_row(
            &self,
            _request: pb::MutateRowRequest,
            _timeout: Duration,
        ) -> Result<tonic::Response<pb::MutateRowResponse>> {
            unimplemented!()
        }

        async fn mutate_rows(
            &self,
            request: pb::MutateRowsRequest,
            _timeout: Duration,
        ) -> Result<ResponseStream<pb::MutateRowsResponse>> {
            self.request_sizes.lock().unwrap().push(request.entries.len());
            let code = self.fail_with.map(|c| c as i32).unwrap_or(0);
            let response = pb::MutateRowsResponse {
                entries: (0..request.entries.len())
                    .map(|idx| pb::mutate_rows_response::Entry {
                        index: idx as i64,
                        status: Some(pb::RpcStatus {
                            code,
                            message: String::new(),
                        }),
                    })
                    .collect(),
            };
            Ok(Box::pin(futures::stream::iter(vec![Ok(response)])))
        }

        async fn check_and_mutate_row(
            &self,
            _request: pb::CheckAndMutateRowRequest,
            _timeout: Duration,
        ) -> Result<tonic::Response<pb::CheckAndMutateRowResponse>> {
            unimplemented!()
        }

        async fn read_modify_write_row(
            &self,
            _request: pb::ReadModifyWriteRowRequest,
            _timeout: Duration,
        ) -> Result<tonic::Response<pb::ReadModifyWriteRowResponse>> {
            unimplemented!()
        }

        async fn ping_and_warm(
            &self,
            _request: pb::PingAndWarmRequest,
            _timeout: Duration,
        ) -> Result<tonic::Response<pb::PingAndWarmResponse>> {
            unimplemented!()
        }
    }

    fn batcher(transport: Arc<AckTransport>, config: BatcherConfig) -> MutationsBatcher {
        MutationsBatcher::new(
            transport,
            MetricsController::disabled(),
            "projects/p/instances/i/tables/t".to_string(),
            String::new(),
            config,
        )
    }

    #[tokio::test]
    async fn test_count_threshold_triggers_partitioned_flush() {
        let transport = AckTransport::ok();
        let batcher = batcher(
            transport.clone(),
            BatcherConfig {
                flush_every: Duration::from_secs(3600),
                flush_at_count: 10,
                max_inflight_entries: 5,
                ..Default::default()
            },
        );
        for idx in 0..10u8 {
            batcher.append(entry(&[idx])).await.unwrap();
        }
        batcher.close().await.unwrap();
        // Reaching the count threshold flushed without an explicit call,
        // and the flow controller split the batch at five in-flight entries.
        let sizes = transport.sizes();
        assert_eq!(sizes, vec![5, 5]);
    }

    #[tokio::test]
    async fn test_appends_beyond_threshold_stay_buffered_until_next_flush() {
        let transport = AckTransport::ok();
        let batcher = batcher(
            transport.clone(),
            BatcherConfig {
                flush_every: Duration::from_secs(3600),
                flush_at_count: 10,
                max_inflight_entries: 5,
                ..Default::default()
            },
        );
        for idx in 0..12u8 {
            batcher.append(entry(&[idx])).await.unwrap();
        }
        batcher.flush().await.unwrap();
        batcher.close().await.unwrap();
        // All twelve entries were submitted, never more than the in-flight
        // cap at a time. Sub-batch sizes depend on scheduling because the
        // threshold flush and the explicit flush share the flow controller.
        let sizes = transport.sizes();
        assert_eq!(sizes.iter().sum::<usize>(), 12);
        assert!(sizes.iter().all(|size| *size <= 5));
    }

    #[tokio::test]
    async fn test_append_after_close_fails() {
        let transport = AckTransport::ok();
        let batcher = batcher(transport.clone(), BatcherConfig::default());
        batcher.append(entry(b"a")).await.unwrap();
        let shared = batcher.shared.clone();
        batcher.close().await.unwrap();
        assert_eq!(transport.sizes(), vec![1]);

        let reopened = MutationsBatcher {
            shared,
            timer: None,
        };
        let result = reopened.append(entry(b"b")).await;
        assert!(matches!(result, Err(Error::BatcherClosed)));
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected() {
        let batcher = batcher(
            AckTransport::ok(),
            BatcherConfig {
                max_inflight_bytes: 16,
                ..Default::default()
            },
        );
        let result = batcher.append(entry(b"way-too-big")).await;
        assert!(matches!(result, Err(Error::EntryTooLarge { .. })));
        batcher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_surface_through_error_queue() {
        let transport = AckTransport::failing(Code::PermissionDenied);
        let batcher = batcher(transport, BatcherConfig::default());
        for idx in 0..3u8 {
            batcher.append(entry(&[idx])).await.unwrap();
        }
        // flush itself does not propagate per-entry failures.
        batcher.flush().await.unwrap();
        let errors = batcher.drain_errors();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|failure| failure.index.is_none()));
        assert_eq!(errors[0].cause.code(), Some(Code::PermissionDenied));
        batcher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_queue_is_lossy_at_head() {
        let transport = AckTransport::failing(Code::PermissionDenied);
        let batcher = batcher(transport, BatcherConfig::default());
        for round in 0..3u8 {
            for idx in 0..50u8 {
                batcher.append(entry(&[round, idx])).await.unwrap();
            }
            batcher.flush().await.unwrap();
        }
        // 150 failures were recorded; only the most recent 100 remain, so
        // the queue now starts at the second round's first entry.
        assert_eq!(batcher.error_count(), ERROR_QUEUE_LIMIT);
        let errors = batcher.drain_errors();
        assert_eq!(errors.first().unwrap().entry.row_key.as_ref(), &[1u8, 0][..]);
        batcher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_timer_flushes_without_caller() {
        let transport = AckTransport::ok();
        let batcher = batcher(
            transport.clone(),
            BatcherConfig {
                flush_every: Duration::from_millis(50),
                ..Default::default()
            },
        );
        batcher.append(entry(b"a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(transport.sizes(), vec![1]);
        batcher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_flushes_remaining() {
        let transport = AckTransport::ok();
        let batcher = batcher(
            transport.clone(),
            BatcherConfig {
                flush_every: Duration::from_secs(3600),
                ..Default::default()
            },
        );
        batcher.append(entry(b"a")).await.unwrap();
        batcher.append(entry(b"b")).await.unwrap();
        batcher.close().await.unwrap();
        assert_eq!(transport.sizes(), vec![2]);
    }
}
