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

//! The client surface: connection lifecycle, instance registration and
//! table handles.
//!
//! A [`Client`] owns the channel pool, the refresh tasks and the set of
//! active instance registrations. [`Table`] handles are lightweight; each
//! registers its `(instance, table, profile)` key on creation and
//! deregisters on drop, and the active set is the union of the keys of all
//! live handles.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use cellstore_pb::v1 as pb;
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::Code;

use crate::batcher::{BatcherConfig, MutationsBatcher};
use crate::config::ClientConfig;
use crate::error::{
    Error, FailedQueryShardError, Result, ShardedReadError, MUTATION_RETRYABLE, READ_RETRYABLE,
};
use crate::metrics::{ActiveOperation, MetricsController, OperationType};
use crate::mutate_rows::{MutateRowsOperation, TerminalCallback};
use crate::mutation::{is_idempotent, MutationEntry};
use crate::pool::{ChannelFactory, ChannelPool, PoolSizer, TrackedChannel};
use crate::query::{filters, ReadQuery};
use crate::read_rows::{ReadRowsOperation, RowStream, DEFAULT_IDLE_TIMEOUT};
use crate::refresh::{start_refresh_tasks, ChannelWarmer};
use crate::row::Row;
use crate::transport::{prepare_request, GrpcTransport, TableTransport};
use crate::util::{retry_rpc, validate_timeouts, AttemptTimeouts};

/// Most sharded sub-queries running at once.
const SHARD_CONCURRENCY: usize = 10;

/// Deadline for a single instance pre-warm ping.
const PING_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_MUTATE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CONDITIONAL_TIMEOUT: Duration = Duration::from_secs(20);

/// One registered warm target: the instance a table handle routes to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub instance_name: String,
    pub table_name: String,
    pub app_profile_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct TableOptions {
    pub app_profile_id: Option<String>,
    pub operation_timeout: Duration,
    pub attempt_timeout: Option<Duration>,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            app_profile_id: None,
            operation_timeout: DEFAULT_READ_TIMEOUT,
            attempt_timeout: None,
        }
    }
}

/// Per-call overrides for deadlines and the retryable code set.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub operation_timeout: Option<Duration>,
    pub attempt_timeout: Option<Duration>,
    pub retryable_codes: Option<Vec<Code>>,
    /// For streaming reads: how long the returned stream may sit unpolled
    /// before it fails with an idle-timeout error. Defaults to 300 s.
    pub idle_timeout: Option<Duration>,
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    pool: Option<Arc<ChannelPool>>,
    transport: Arc<dyn TableTransport>,
    metrics: MetricsController,
    /// Instance key -> ids of the table handles holding it.
    registry: Mutex<HashMap<InstanceKey, HashSet<u64>>>,
    refresh_tasks: Mutex<Vec<JoinHandle<()>>>,
    sizer_task: Mutex<Option<(JoinHandle<()>, UnboundedSender<()>)>>,
    shutdown: watch::Sender<bool>,
    next_handle_id: AtomicU64,
}

impl ClientInner {
    /// Adds an owner for the key; true when the key is newly active.
    fn register(&self, key: InstanceKey, handle_id: u64) -> bool {
        let mut registry = self.registry.lock();
        let owners = registry.entry(key).or_default();
        owners.insert(handle_id);
        owners.len() == 1
    }

    /// Removes one owner; the key leaves the active set with its last one.
    fn deregister(&self, key: &InstanceKey, handle_id: u64) {
        let mut registry = self.registry.lock();
        if let Some(owners) = registry.get_mut(key) {
            owners.remove(&handle_id);
            if owners.is_empty() {
                registry.remove(key);
            }
        }
    }

    fn active_instances(&self) -> Vec<InstanceKey> {
        self.registry.lock().keys().cloned().collect()
    }

    /// Pings every registered instance on `channel`, at most once per
    /// distinct (instance, profile), tolerating partial failure.
    async fn ping_instances_on_channel(&self, channel: &TrackedChannel) {
        let targets: HashSet<(String, Option<String>)> = self
            .active_instances()
            .into_iter()
            .map(|key| (key.instance_name, key.app_profile_id))
            .collect();
        let pings = targets.into_iter().map(|(name, profile)| {
            let mut stub = channel.stub();
            let credentials = self.config.credentials.clone();
            async move {
                let request = pb::PingAndWarmRequest {
                    name: name.clone(),
                    app_profile_id: profile.unwrap_or_default(),
                };
                let prepared =
                    match prepare_request(request, PING_TIMEOUT, None, credentials.as_deref()) {
                        Ok(prepared) => prepared,
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to build pre-warm request");
                            return;
                        }
                    };
                if let Err(err) = stub.ping_and_warm(prepared).await {
                    tracing::debug!(instance = %name, error = %err, "instance pre-warm failed");
                }
            }
        });
        futures::future::join_all(pings).await;
    }

    /// First registration of an instance: warm it on every pooled channel.
    async fn warm_instance_on_all_channels(&self, key: InstanceKey) {
        let Some(pool) = self.pool.as_ref() else {
            return;
        };
        for channel in pool.snapshot() {
            let mut stub = channel.stub();
            let request = pb::PingAndWarmRequest {
                name: key.instance_name.clone(),
                app_profile_id: key.app_profile_id.clone().unwrap_or_default(),
            };
            match prepare_request(
                request,
                PING_TIMEOUT,
                None,
                self.config.credentials.as_deref(),
            ) {
                Ok(prepared) => {
                    if let Err(err) = stub.ping_and_warm(prepared).await {
                        tracing::debug!(
                            instance = %key.instance_name,
                            error = %err,
                            "instance pre-warm failed"
                        );
                    }
                }
                Err(err) => tracing::warn!(error = %err, "failed to build pre-warm request"),
            }
        }
    }

    fn create_operation(&self, op_type: OperationType, is_streaming: bool) -> ActiveOperation {
        self.metrics.create_operation(op_type, is_streaming)
    }
}

/// Pre-warms refreshed channels against the currently registered instances.
struct RegistryWarmer {
    inner: Weak<ClientInner>,
}

#[async_trait]
impl ChannelWarmer for RegistryWarmer {
    async fn warm(&self, channel: &TrackedChannel) {
        if let Some(inner) = self.inner.upgrade() {
            inner.ping_instances_on_channel(channel).await;
        }
    }
}

/// Data-plane client. Cloning is cheap; all clones share one pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Builds the channel pool and starts the background refresh tasks
    /// (and the pool sizer, when configured). Must run inside a tokio
    /// runtime. Channels connect lazily; no network traffic happens until
    /// the first RPC or pre-warm.
    pub async fn connect(config: ClientConfig) -> Result<Client> {
        config.validate()?;
        let endpoint = match &config.emulator_host {
            Some(host) => format!("http://{}", host),
            None => config.endpoint.clone(),
        };
        let factory: ChannelFactory = {
            let endpoint = endpoint.clone();
            let user_agent = config.user_agent.clone();
            Arc::new(move || {
                let builder = tonic::transport::Endpoint::from_shared(endpoint.clone())
                    .map_err(|err| {
                        Error::Config(format!("invalid endpoint {}: {}", endpoint, err))
                    })?
                    .user_agent(user_agent.clone())
                    .map_err(|err| Error::Config(format!("invalid user agent: {}", err)))?
                    .connect_timeout(Duration::from_secs(10));
                Ok(builder.connect_lazy())
            })
        };
        let pool = Arc::new(ChannelPool::new(config.pool_size, factory)?);
        let transport = Arc::new(GrpcTransport::new(pool.clone(), config.credentials.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(ClientInner {
            pool: Some(pool.clone()),
            transport,
            metrics: crate::metrics::global_controller().clone(),
            registry: Mutex::new(HashMap::new()),
            refresh_tasks: Mutex::new(Vec::new()),
            sizer_task: Mutex::new(None),
            shutdown: shutdown_tx,
            next_handle_id: AtomicU64::new(0),
            config,
        });

        // The emulator neither expires channels nor understands warming.
        if inner.config.emulator_host.is_none() {
            let warmer = Arc::new(RegistryWarmer {
                inner: Arc::downgrade(&inner),
            });
            let tasks = start_refresh_tasks(
                pool.clone(),
                warmer,
                (&inner.config.refresh).into(),
                Instant::now(),
                shutdown_rx,
            );
            *inner.refresh_tasks.lock() = tasks;
        }
        if let Some(sizer_options) = &inner.config.sizer {
            let sizer = PoolSizer::new(pool, sizer_options.into());
            *inner.sizer_task.lock() = Some(sizer.start());
        }

        Ok(Client { inner })
    }

    /// A client over an in-memory transport; no pool, no background tasks.
    /// The low-level seam for tests and custom transports.
    pub fn mock(transport: Arc<dyn TableTransport>) -> Client {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Client {
            inner: Arc::new(ClientInner {
                config: ClientConfig::new("mock-project"),
                pool: None,
                transport,
                metrics: MetricsController::disabled(),
                registry: Mutex::new(HashMap::new()),
                refresh_tasks: Mutex::new(Vec::new()),
                sizer_task: Mutex::new(None),
                shutdown: shutdown_tx,
                next_handle_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn project(&self) -> &str {
        &self.inner.config.project
    }

    pub fn table(&self, instance_id: &str, table_id: &str) -> Table {
        self.build_table(instance_id, table_id, TableOptions::default())
    }

    pub fn table_with_options(
        &self,
        instance_id: &str,
        table_id: &str,
        options: TableOptions,
    ) -> Result<Table> {
        validate_timeouts(options.operation_timeout, options.attempt_timeout)?;
        Ok(self.build_table(instance_id, table_id, options))
    }

    fn build_table(&self, instance_id: &str, table_id: &str, options: TableOptions) -> Table {
        let instance_name = format!(
            "projects/{}/instances/{}",
            self.inner.config.project, instance_id
        );
        let table_name = format!("{}/tables/{}", instance_name, table_id);
        let key = InstanceKey {
            instance_name,
            table_name,
            app_profile_id: options.app_profile_id.clone(),
        };
        let handle_id = self.inner.next_handle_id.fetch_add(1, Ordering::Relaxed);
        if self.inner.register(key.clone(), handle_id) {
            let inner = self.inner.clone();
            let warm_key = key.clone();
            tokio::spawn(async move {
                inner.warm_instance_on_all_channels(warm_key).await;
            });
        }
        Table {
            inner: self.inner.clone(),
            handle_id,
            key,
            instance_id: instance_id.to_string(),
            table_id: table_id.to_string(),
            app_profile_id: options.app_profile_id.unwrap_or_default(),
            default_operation_timeout: options.operation_timeout,
            default_attempt_timeout: options.attempt_timeout,
        }
    }

    /// Stops the refresh and sizer tasks, waiting up to `timeout` for them
    /// to finish. Grace-period closes of already replaced channels are not
    /// waited for; they run to completion on their own.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        let _ = self.inner.shutdown.send(true);
        let mut tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.inner.refresh_tasks.lock());
        if let Some((handle, sizer_shutdown)) = self.inner.sizer_task.lock().take() {
            let _ = sizer_shutdown.send(());
            tasks.push(handle);
        }
        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!("timed out waiting for background tasks; aborting them");
            for abort in aborts {
                abort.abort();
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn active_instance_count(&self) -> usize {
        self.inner.registry.lock().len()
    }
}

/// Handle for data-plane requests against one table.
pub struct Table {
    inner: Arc<ClientInner>,
    handle_id: u64,
    key: InstanceKey,
    pub instance_id: String,
    pub table_id: String,
    app_profile_id: String,
    default_operation_timeout: Duration,
    default_attempt_timeout: Option<Duration>,
}

impl Table {
    pub fn table_name(&self) -> &str {
        &self.key.table_name
    }

    pub fn instance_name(&self) -> &str {
        &self.key.instance_name
    }

    fn read_budgets(&self, options: &CallOptions) -> Result<(Duration, Option<Duration>)> {
        let operation = options
            .operation_timeout
            .unwrap_or(self.default_operation_timeout);
        let attempt = options.attempt_timeout.or(self.default_attempt_timeout);
        validate_timeouts(operation, attempt)?;
        Ok((operation, attempt))
    }

    fn write_budgets(
        &self,
        options: &CallOptions,
        default_operation: Duration,
    ) -> Result<(Duration, Option<Duration>)> {
        let operation = options.operation_timeout.unwrap_or(default_operation);
        let attempt = options.attempt_timeout.or(self.default_attempt_timeout);
        validate_timeouts(operation, attempt)?;
        Ok((operation, attempt))
    }

    /// Streams the rows selected by `query`, retrying under the table's
    /// default deadlines. Emitted row keys are strictly increasing.
    pub fn read_rows_stream(&self, query: ReadQuery) -> Result<RowStream> {
        self.read_rows_stream_with(query, CallOptions::default())
    }

    pub fn read_rows_stream_with(
        &self,
        query: ReadQuery,
        options: CallOptions,
    ) -> Result<RowStream> {
        let (operation_timeout, attempt_timeout) = self.read_budgets(&options)?;
        if query.limit() == Some(0) {
            return Ok(RowStream::empty());
        }
        let retryable = options
            .retryable_codes
            .unwrap_or_else(|| READ_RETRYABLE.to_vec());
        let request = query.to_pb(&self.key.table_name, &self.app_profile_id);
        let metrics = self.inner.create_operation(OperationType::ReadRows, true);
        let operation = ReadRowsOperation::new(
            self.inner.transport.clone(),
            request,
            operation_timeout,
            attempt_timeout,
            retryable,
            metrics,
        );
        Ok(operation.into_stream(options.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT)))
    }

    /// Materializes `read_rows_stream`.
    pub async fn read_rows(&self, query: ReadQuery) -> Result<Vec<Row>> {
        self.read_rows_with(query, CallOptions::default()).await
    }

    pub async fn read_rows_with(
        &self,
        query: ReadQuery,
        options: CallOptions,
    ) -> Result<Vec<Row>> {
        self.read_rows_stream_with(query, options)?
            .try_collect()
            .await
    }

    /// Reads one row, or `None` when it does not exist.
    pub async fn read_row(
        &self,
        row_key: impl Into<Bytes>,
        filter: Option<pb::RowFilter>,
    ) -> Result<Option<Row>> {
        let mut query = ReadQuery::new().with_key(row_key).with_limit(1);
        if let Some(filter) = filter {
            query = query.with_filter(filter);
        }
        let mut rows = self.read_rows(query).await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    /// Existence check that moves no cell data: one cell per row, values
    /// stripped.
    pub async fn row_exists(&self, row_key: impl Into<Bytes>) -> Result<bool> {
        let filter = filters::chain(vec![filters::cells_per_row_limit(1), filters::strip_value()]);
        let query = ReadQuery::new()
            .with_key(row_key)
            .with_limit(1)
            .with_filter(filter);
        Ok(!self.read_rows(query).await?.is_empty())
    }

    /// Runs the queries in parallel (at most ten at once) and concatenates
    /// their rows in query order. Partial failures are collected into a
    /// sharded-read group error.
    pub async fn read_rows_sharded(&self, queries: Vec<ReadQuery>) -> Result<Vec<Row>> {
        self.read_rows_sharded_with(queries, CallOptions::default())
            .await
    }

    pub async fn read_rows_sharded_with(
        &self,
        queries: Vec<ReadQuery>,
        options: CallOptions,
    ) -> Result<Vec<Row>> {
        if queries.is_empty() {
            return Err(Error::Config(
                "read_rows_sharded requires at least one query".to_string(),
            ));
        }
        let total_shards = queries.len();
        let results: Vec<(usize, ReadQuery, Result<Vec<Row>>)> =
            futures::stream::iter(queries.into_iter().enumerate())
                .map(|(index, query)| {
                    let options = options.clone();
                    async move {
                        let result = self.read_rows_with(query.clone(), options).await;
                        (index, query, result)
                    }
                })
                .buffered(SHARD_CONCURRENCY)
                .collect()
                .await;

        let mut rows = Vec::new();
        let mut failures = Vec::new();
        for (index, query, result) in results {
            match result {
                Ok(mut shard_rows) => rows.append(&mut shard_rows),
                Err(cause) => failures.push(FailedQueryShardError {
                    index,
                    query,
                    cause: Box::new(cause),
                }),
            }
        }
        if failures.is_empty() {
            Ok(rows)
        } else {
            Err(Error::ShardedRead(ShardedReadError {
                failures,
                total_shards,
            }))
        }
    }

    /// Returns `(row_key, offset_bytes)` samples delimiting contiguous
    /// sections of the table, for use with `ReadQuery::shard`.
    pub async fn sample_row_keys(&self) -> Result<Vec<(Bytes, i64)>> {
        self.sample_row_keys_with(CallOptions::default()).await
    }

    pub async fn sample_row_keys_with(
        &self,
        options: CallOptions,
    ) -> Result<Vec<(Bytes, i64)>> {
        let (operation_timeout, attempt_timeout) = self.read_budgets(&options)?;
        let retryable = options
            .retryable_codes
            .unwrap_or_else(|| READ_RETRYABLE.to_vec());
        let request = pb::SampleRowKeysRequest {
            table_name: self.key.table_name.clone(),
            app_profile_id: self.app_profile_id.clone(),
        };
        let mut metrics = self
            .inner
            .create_operation(OperationType::SampleRowKeys, false);
        let transport = self.inner.transport.clone();
        let result = retry_rpc(
            AttemptTimeouts::new(operation_timeout, attempt_timeout),
            &retryable,
            &mut metrics,
            move |budget| {
                let transport = transport.clone();
                let request = request.clone();
                async move {
                    let mut stream = transport.sample_row_keys(request, budget).await?;
                    let mut samples = Vec::new();
                    while let Some(response) = stream.next().await {
                        let response = response.map_err(Error::from)?;
                        samples.push((response.row_key, response.offset_bytes));
                    }
                    Ok((samples, None))
                }
            },
        )
        .await?;
        Ok(result)
    }

    /// Applies mutations to one row atomically. Retried only when every
    /// mutation carries an explicit timestamp.
    pub async fn mutate_row(
        &self,
        row_key: impl Into<Bytes>,
        mutations: Vec<pb::Mutation>,
    ) -> Result<()> {
        self.mutate_row_with(row_key, mutations, CallOptions::default())
            .await
    }

    pub async fn mutate_row_with(
        &self,
        row_key: impl Into<Bytes>,
        mutations: Vec<pb::Mutation>,
        options: CallOptions,
    ) -> Result<()> {
        if mutations.is_empty() {
            return Err(Error::Config(
                "mutate_row requires at least one mutation".to_string(),
            ));
        }
        let (operation_timeout, attempt_timeout) =
            self.write_budgets(&options, DEFAULT_MUTATE_TIMEOUT)?;
        let retryable = if mutations.iter().all(is_idempotent) {
            options
                .retryable_codes
                .unwrap_or_else(|| MUTATION_RETRYABLE.to_vec())
        } else {
            Vec::new()
        };
        let request = pb::MutateRowRequest {
            table_name: self.key.table_name.clone(),
            app_profile_id: self.app_profile_id.clone(),
            row_key: row_key.into(),
            mutations,
        };
        let mut metrics = self.inner.create_operation(OperationType::MutateRow, false);
        let transport = self.inner.transport.clone();
        retry_rpc(
            AttemptTimeouts::new(operation_timeout, attempt_timeout),
            &retryable,
            &mut metrics,
            move |budget| {
                let transport = transport.clone();
                let request = request.clone();
                async move {
                    let response = transport.mutate_row(request, budget).await?;
                    let (metadata, _message, _extensions) = response.into_parts();
                    Ok(((), Some(metadata)))
                }
            },
        )
        .await
    }

    /// Applies a batch of entries, each atomically; retries the retryable
    /// idempotent subset and reports per-entry failures as a group error.
    pub async fn bulk_mutate_rows(&self, entries: Vec<MutationEntry>) -> Result<()> {
        self.bulk_mutate_rows_with(entries, CallOptions::default(), None)
            .await
    }

    pub async fn bulk_mutate_rows_with(
        &self,
        entries: Vec<MutationEntry>,
        options: CallOptions,
        on_terminal: Option<TerminalCallback>,
    ) -> Result<()> {
        let (operation_timeout, attempt_timeout) =
            self.write_budgets(&options, DEFAULT_MUTATE_TIMEOUT)?;
        let retryable = options
            .retryable_codes
            .unwrap_or_else(|| MUTATION_RETRYABLE.to_vec());
        let metrics = self
            .inner
            .create_operation(OperationType::BulkMutateRows, false);
        let operation = MutateRowsOperation::new(
            self.inner.transport.clone(),
            self.key.table_name.clone(),
            self.app_profile_id.clone(),
            entries,
            operation_timeout,
            attempt_timeout,
            retryable,
            on_terminal,
            metrics,
        );
        operation.run().await
    }

    /// A background-flushing batcher bound to this table.
    pub fn mutations_batcher(&self, config: BatcherConfig) -> MutationsBatcher {
        MutationsBatcher::new(
            self.inner.transport.clone(),
            self.inner.metrics.clone(),
            self.key.table_name.clone(),
            self.app_profile_id.clone(),
            config,
        )
    }

    /// Conditionally mutates one row on a predicate filter. Never retried.
    pub async fn check_and_mutate_row(
        &self,
        row_key: impl Into<Bytes>,
        predicate: Option<pb::RowFilter>,
        true_mutations: Vec<pb::Mutation>,
        false_mutations: Vec<pb::Mutation>,
    ) -> Result<bool> {
        self.check_and_mutate_row_with(
            row_key,
            predicate,
            true_mutations,
            false_mutations,
            CallOptions::default(),
        )
        .await
    }

    pub async fn check_and_mutate_row_with(
        &self,
        row_key: impl Into<Bytes>,
        predicate: Option<pb::RowFilter>,
        true_mutations: Vec<pb::Mutation>,
        false_mutations: Vec<pb::Mutation>,
        options: CallOptions,
    ) -> Result<bool> {
        if true_mutations.is_empty() && false_mutations.is_empty() {
            return Err(Error::Config(
                "check_and_mutate_row requires mutations for at least one branch".to_string(),
            ));
        }
        let (operation_timeout, attempt_timeout) =
            self.write_budgets(&options, DEFAULT_CONDITIONAL_TIMEOUT)?;
        let retryable = options.retryable_codes.unwrap_or_default();
        let request = pb::CheckAndMutateRowRequest {
            table_name: self.key.table_name.clone(),
            app_profile_id: self.app_profile_id.clone(),
            row_key: row_key.into(),
            predicate_filter: predicate,
            true_mutations,
            false_mutations,
        };
        let mut metrics = self
            .inner
            .create_operation(OperationType::CheckAndMutate, false);
        let transport = self.inner.transport.clone();
        retry_rpc(
            AttemptTimeouts::new(operation_timeout, attempt_timeout),
            &retryable,
            &mut metrics,
            move |budget| {
                let transport = transport.clone();
                let request = request.clone();
                async move {
                    let response = transport.check_and_mutate_row(request, budget).await?;
                    let (metadata, message, _extensions) = response.into_parts();
                    Ok((message.predicate_matched, Some(metadata)))
                }
            },
        )
        .await
    }

    /// Atomically reads and transforms one row by append/increment rules,
    /// returning the modified cells. Never retried.
    pub async fn read_modify_write_row(
        &self,
        row_key: impl Into<Bytes>,
        rules: Vec<pb::ReadModifyWriteRule>,
    ) -> Result<Row> {
        self.read_modify_write_row_with(row_key, rules, CallOptions::default())
            .await
    }

    pub async fn read_modify_write_row_with(
        &self,
        row_key: impl Into<Bytes>,
        rules: Vec<pb::ReadModifyWriteRule>,
        options: CallOptions,
    ) -> Result<Row> {
        if rules.is_empty() {
            return Err(Error::Config(
                "read_modify_write_row requires at least one rule".to_string(),
            ));
        }
        let (operation_timeout, attempt_timeout) =
            self.write_budgets(&options, DEFAULT_CONDITIONAL_TIMEOUT)?;
        let retryable = options.retryable_codes.unwrap_or_default();
        let request = pb::ReadModifyWriteRowRequest {
            table_name: self.key.table_name.clone(),
            app_profile_id: self.app_profile_id.clone(),
            row_key: row_key.into(),
            rules,
        };
        let mut metrics = self
            .inner
            .create_operation(OperationType::ReadModifyWrite, false);
        let transport = self.inner.transport.clone();
        let row = retry_rpc(
            AttemptTimeouts::new(operation_timeout, attempt_timeout),
            &retryable,
            &mut metrics,
            move |budget| {
                let transport = transport.clone();
                let request = request.clone();
                async move {
                    let response = transport.read_modify_write_row(request, budget).await?;
                    let (metadata, message, _extensions) = response.into_parts();
                    let row = message.row.ok_or_else(|| {
                        Error::Rpc(tonic::Status::internal(
                            "read_modify_write_row response carried no row",
                        ))
                    })?;
                    Ok((row, Some(metadata)))
                }
            },
        )
        .await?;
        Ok(Row::from_pb(row))
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        self.inner.deregister(&self.key, self.handle_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ResponseStream;

    struct NoopTransport;

    #[async_trait]
    impl TableTransport for NoopTransport {
        async fn read_rows(
            &self,
            _request: pb::ReadRowsRequest,
            _timeout: Duration,
        ) -> Result<ResponseStream<pb::ReadRowsResponse>> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn sample_row_keys(
            &self,
            _request: pb::SampleRowKeysRequest,
            _timeout: Duration,
        ) -> Result<ResponseStream<pb::SampleRowKeysResponse>> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn mutate_row(
            &self,
            _request: pb::MutateRowRequest,
            _timeout: Duration,
        ) -> Result<tonic::Response<pb::MutateRowResponse>> {
            Ok(tonic::Response::new(pb::MutateRowResponse {}))
        }

        async fn mutate_rows(
            &self,
            _request: pb::MutateRowsRequest,
            _timeout: Duration,
        ) -> Result<ResponseStream<pb::MutateRowsResponse>> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn check_and_mutate_row(
            &self,
            _request: pb::CheckAndMutateRowRequest,
            _timeout: Duration,
        ) -> Result<tonic::Response<pb::CheckAndMutateRowResponse>> {
            Ok(tonic::Response::new(pb::CheckAndMutateRowResponse {
                predicate_matched: true,
            }))
        }

        async fn read_modify_write_row(
            &self,
            _request: pb::ReadModifyWriteRowRequest,
            _timeout: Duration,
        ) -> Result<tonic::Response<pb::ReadModifyWriteRowResponse>> {
            Ok(tonic::Response::new(pb::ReadModifyWriteRowResponse {
                row: Some(pb::ProtoRow {
                    key: Bytes::from_static(b"r"),
                    families: vec![],
                }),
            }))
        }

        async fn ping_and_warm(
            &self,
            _request: pb::PingAndWarmRequest,
            _timeout: Duration,
        ) -> Result<tonic::Response<pb::PingAndWarmResponse>> {
            Ok(tonic::Response::new(pb::PingAndWarmResponse {}))
        }
    }

    #[tokio::test]
    async fn test_connect_and_close_stops_background_tasks() {
        // Channels are lazy, no instances are registered, and close fires
        // the shutdown signal: the whole lifecycle runs without a network.
        let client = Client::connect(ClientConfig::new("p")).await.unwrap();
        assert_eq!(client.inner.pool.as_ref().unwrap().size(), 3);
        assert_eq!(client.inner.refresh_tasks.lock().len(), 3);

        client.close(Duration::from_secs(1)).await.unwrap();
        assert!(client.inner.refresh_tasks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_table_names() {
        let client = Client::mock(Arc::new(NoopTransport));
        let table = client.table("my-instance", "my-table");
        assert_eq!(
            table.table_name(),
            "projects/mock-project/instances/my-instance/tables/my-table"
        );
        assert_eq!(
            table.instance_name(),
            "projects/mock-project/instances/my-instance"
        );
    }

    #[tokio::test]
    async fn test_instance_registration_is_reference_counted() {
        let client = Client::mock(Arc::new(NoopTransport));
        assert_eq!(client.active_instance_count(), 0);
        let first = client.table("i", "t");
        let second = client.table("i", "t");
        // Same key, two owners.
        assert_eq!(client.active_instance_count(), 1);
        let other = client.table("i2", "t");
        assert_eq!(client.active_instance_count(), 2);

        drop(first);
        assert_eq!(client.active_instance_count(), 2);
        drop(second);
        // Last owner gone: the key leaves the active set.
        assert_eq!(client.active_instance_count(), 1);
        drop(other);
        assert_eq!(client.active_instance_count(), 0);
    }

    #[tokio::test]
    async fn test_profiles_are_distinct_registrations() {
        let client = Client::mock(Arc::new(NoopTransport));
        let _plain = client.table("i", "t");
        let _profiled = client
            .table_with_options(
                "i",
                "t",
                TableOptions {
                    app_profile_id: Some("profile".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(client.active_instance_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_table_timeouts_rejected() {
        let client = Client::mock(Arc::new(NoopTransport));
        let result = client.table_with_options(
            "i",
            "t",
            TableOptions {
                operation_timeout: Duration::from_secs(5),
                attempt_timeout: Some(Duration::from_secs(10)),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_call_option_validation() {
        let client = Client::mock(Arc::new(NoopTransport));
        let table = client.table("i", "t");
        let result = table
            .read_rows_with(
                ReadQuery::new(),
                CallOptions {
                    operation_timeout: Some(Duration::from_secs(1)),
                    attempt_timeout: Some(Duration::from_secs(2)),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_limit_zero_reads_nothing_without_rpc() {
        let client = Client::mock(Arc::new(NoopTransport));
        let table = client.table("i", "t");
        let rows = table
            .read_rows(ReadQuery::new().with_key(&b"k"[..]).with_limit(0))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_simple_unary_surfaces() {
        let client = Client::mock(Arc::new(NoopTransport));
        let table = client.table("i", "t");
        table
            .mutate_row(
                &b"r"[..],
                vec![crate::mutation::set_cell("f", &b"q"[..], &b"v"[..], Some(1))],
            )
            .await
            .unwrap();
        let matched = table
            .check_and_mutate_row(
                &b"r"[..],
                None,
                vec![crate::mutation::delete_from_row()],
                vec![],
            )
            .await
            .unwrap();
        assert!(matched);
        let row = table
            .read_modify_write_row(
                &b"r"[..],
                vec![crate::mutation::increment_rule("f", &b"q"[..], 1)],
            )
            .await
            .unwrap();
        assert_eq!(row.key().as_ref(), b"r");
        assert!(table.sample_row_keys().await.unwrap().is_empty());
    }
}
