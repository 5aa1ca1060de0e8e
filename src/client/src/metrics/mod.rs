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

//! Client-side operation metrics.
//!
//! Every retried operation owns an [`ActiveOperation`] that walks the state
//! machine Created -> ActiveAttempt -> BetweenAttempts -> ... -> Completed.
//! Completed attempts and operations are handed to the registered
//! [`MetricsHandler`] sinks as immutable records. An out-of-order lifecycle
//! call is a recorder bug, not a caller error: it logs a warning and is
//! otherwise ignored.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use lazy_static::lazy_static;
use prost::Message;
use regex::Regex;
use tonic::metadata::MetadataMap;
use tonic::Code;

pub mod handlers;

pub use handlers::{LogMetricsHandler, PrometheusMetricsHandler};

/// Trailer carrying a serialized `ResponseParams` message.
pub const RESPONSE_PARAMS_METADATA_KEY: &str = "x-response-params-bin";
/// Trailer carrying the server-side latency of the attempt.
pub const SERVER_TIMING_METADATA_KEY: &str = "server-timing";

/// Reported when the server never disclosed the routing cluster / zone.
pub const DEFAULT_CLUSTER_ID: &str = "unspecified";
pub const DEFAULT_ZONE: &str = "global";

lazy_static! {
    static ref SERVER_TIMING_REGEX: Regex =
        Regex::new(r".*gfet4t7;\s*dur=(\d+\.?\d*).*").unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationType {
    ReadRows,
    SampleRowKeys,
    BulkMutateRows,
    MutateRow,
    CheckAndMutate,
    ReadModifyWrite,
    PingAndWarm,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::ReadRows => "ReadRows",
            OperationType::SampleRowKeys => "SampleRowKeys",
            OperationType::BulkMutateRows => "MutateRows",
            OperationType::MutateRow => "MutateRow",
            OperationType::CheckAndMutate => "CheckAndMutateRow",
            OperationType::ReadModifyWrite => "ReadModifyWriteRow",
            OperationType::PingAndWarm => "PingAndWarm",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationState {
    Created,
    ActiveAttempt,
    BetweenAttempts,
    Completed,
}

/// Immutable record of one finished RPC attempt.
#[derive(Clone, Debug)]
pub struct CompletedAttempt {
    pub start_time: SystemTime,
    pub duration: Duration,
    pub status: Code,
    pub first_response_latency: Option<Duration>,
    /// Server-side latency from the `server-timing` trailer, milliseconds.
    pub server_latency_ms: Option<f64>,
    pub backoff_before_attempt: Duration,
}

/// Immutable record of one finished operation, attempts included.
#[derive(Clone, Debug)]
pub struct CompletedOperation {
    pub op_type: OperationType,
    pub start_time: SystemTime,
    pub duration: Duration,
    pub attempts: Vec<CompletedAttempt>,
    pub final_status: Code,
    pub cluster_id: String,
    pub zone: String,
    pub is_streaming: bool,
    pub flow_throttling: Duration,
}

/// A metrics sink. Implementations receive completed records and must not
/// block the calling task for longer than a short bounded time.
pub trait MetricsHandler: Send + Sync {
    fn on_attempt_complete(&self, _attempt: &CompletedAttempt, _operation: &ActiveOperation) {}
    fn on_operation_complete(&self, _operation: &CompletedOperation) {}
}

#[derive(Debug)]
struct ActiveAttempt {
    start_wall: SystemTime,
    start_mono: Instant,
    first_response_latency: Option<Duration>,
    server_latency_ms: Option<f64>,
    backoff_before_attempt: Duration,
}

/// Mutable per-operation recorder. One instance per logical operation; the
/// drivers call into it at every lifecycle edge.
pub struct ActiveOperation {
    op_type: OperationType,
    start_wall: SystemTime,
    start_mono: Instant,
    active_attempt: Option<ActiveAttempt>,
    completed_attempts: Vec<CompletedAttempt>,
    cluster_id: Option<String>,
    zone: Option<String>,
    is_streaming: bool,
    completed: bool,
    flow_throttling: Duration,
    last_attempt_end: Option<Instant>,
    handlers: Arc<Vec<Box<dyn MetricsHandler>>>,
}

impl ActiveOperation {
    fn new(
        op_type: OperationType,
        is_streaming: bool,
        handlers: Arc<Vec<Box<dyn MetricsHandler>>>,
    ) -> Self {
        Self {
            op_type,
            start_wall: SystemTime::now(),
            start_mono: Instant::now(),
            active_attempt: None,
            completed_attempts: Vec::new(),
            cluster_id: None,
            zone: None,
            is_streaming,
            completed: false,
            flow_throttling: Duration::ZERO,
            last_attempt_end: None,
            handlers,
        }
    }

    pub fn op_type(&self) -> OperationType {
        self.op_type
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn state(&self) -> OperationState {
        if self.completed {
            OperationState::Completed
        } else if self.active_attempt.is_some() {
            OperationState::ActiveAttempt
        } else if self.completed_attempts.is_empty() {
            OperationState::Created
        } else {
            OperationState::BetweenAttempts
        }
    }

    pub fn completed_attempt_count(&self) -> usize {
        self.completed_attempts.len()
    }

    /// Optionally re-stamps the operation start; implicit at construction.
    pub fn start(&mut self) {
        if self.state() != OperationState::Created {
            return self.handle_invalid("start");
        }
        self.start_wall = SystemTime::now();
        self.start_mono = Instant::now();
    }

    /// Opens a new attempt, recording the backoff since the previous one.
    pub fn start_attempt(&mut self) {
        let state = self.state();
        if state != OperationState::Created && state != OperationState::BetweenAttempts {
            return self.handle_invalid("start_attempt");
        }
        let backoff = self
            .last_attempt_end
            .map(|end| end.elapsed())
            .unwrap_or(Duration::ZERO);
        self.active_attempt = Some(ActiveAttempt {
            start_wall: SystemTime::now(),
            start_mono: Instant::now(),
            first_response_latency: None,
            server_latency_ms: None,
            backoff_before_attempt: backoff,
        });
    }

    /// Extracts routing information and server latency from trailers.
    /// Cluster and zone are captured once per operation.
    pub fn record_metadata(&mut self, metadata: &MetadataMap) {
        if self.state() != OperationState::ActiveAttempt {
            return self.handle_invalid("record_metadata");
        }
        if self.cluster_id.is_none() || self.zone.is_none() {
            if let Some(blob) = metadata.get_bin(RESPONSE_PARAMS_METADATA_KEY) {
                match blob
                    .to_bytes()
                    .map_err(|_| ())
                    .and_then(|b| cellstore_pb::v1::ResponseParams::decode(b).map_err(|_| ()))
                {
                    Ok(params) => {
                        if self.cluster_id.is_none() {
                            self.cluster_id = params.cluster_id;
                        }
                        if self.zone.is_none() {
                            self.zone = params.zone_id;
                        }
                    }
                    Err(()) => {
                        tracing::warn!(
                            key = RESPONSE_PARAMS_METADATA_KEY,
                            "failed to decode response params trailer"
                        );
                    }
                }
            }
        }
        if let Some(timing) = metadata
            .get(SERVER_TIMING_METADATA_KEY)
            .and_then(|v| v.to_str().ok())
        {
            if let Some(captures) = SERVER_TIMING_REGEX.captures(timing) {
                if let Ok(latency_ms) = captures[1].parse::<f64>() {
                    if let Some(attempt) = self.active_attempt.as_mut() {
                        attempt.server_latency_ms = Some(latency_ms);
                    }
                }
            }
        }
    }

    /// Stamps the latency of the first streamed response of this attempt.
    pub fn attempt_first_response(&mut self) {
        if self.state() != OperationState::ActiveAttempt {
            return self.handle_invalid("attempt_first_response");
        }
        let attempt = self.active_attempt.as_mut().unwrap();
        if attempt.first_response_latency.is_some() {
            return self.handle_invalid("attempt_first_response (duplicate)");
        }
        attempt.first_response_latency = Some(attempt.start_mono.elapsed());
    }

    /// Closes the active attempt, typically before a retry.
    pub fn end_attempt(&mut self, status: Code) {
        if self.state() != OperationState::ActiveAttempt {
            return self.handle_invalid("end_attempt");
        }
        let attempt = self.active_attempt.take().unwrap();
        let completed = CompletedAttempt {
            start_time: attempt.start_wall,
            duration: attempt.start_mono.elapsed(),
            status,
            first_response_latency: attempt.first_response_latency,
            server_latency_ms: attempt.server_latency_ms,
            backoff_before_attempt: attempt.backoff_before_attempt,
        };
        self.completed_attempts.push(completed.clone());
        self.last_attempt_end = Some(Instant::now());
        for handler in self.handlers.clone().iter() {
            handler.on_attempt_complete(&completed, self);
        }
    }

    /// Closes the operation; an open attempt is closed with the same status.
    pub fn end(&mut self, status: Code) {
        if self.state() == OperationState::Completed {
            return self.handle_invalid("end");
        }
        if self.state() == OperationState::ActiveAttempt {
            self.end_attempt(status);
        }
        self.completed = true;
        let finalized = CompletedOperation {
            op_type: self.op_type,
            start_time: self.start_wall,
            duration: self.start_mono.elapsed(),
            attempts: self.completed_attempts.clone(),
            final_status: status,
            cluster_id: self
                .cluster_id
                .clone()
                .unwrap_or_else(|| DEFAULT_CLUSTER_ID.to_string()),
            zone: self.zone.clone().unwrap_or_else(|| DEFAULT_ZONE.to_string()),
            is_streaming: self.is_streaming,
            flow_throttling: self.flow_throttling,
        };
        for handler in self.handlers.iter() {
            handler.on_operation_complete(&finalized);
        }
    }

    /// Accumulates time an operation spent waiting on flow control.
    pub fn add_flow_throttling(&mut self, waited: Duration) {
        self.flow_throttling += waited;
    }

    fn handle_invalid(&self, call: &str) {
        tracing::warn!(
            call,
            state = ?self.state(),
            op = self.op_type.as_str(),
            "ignoring metrics call in invalid state"
        );
    }
}

/// Creates operations and fans their records out to the registered sinks.
#[derive(Clone)]
pub struct MetricsController {
    handlers: Arc<Vec<Box<dyn MetricsHandler>>>,
}

impl MetricsController {
    pub fn new(handlers: Vec<Box<dyn MetricsHandler>>) -> Self {
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// A controller that records nothing.
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    pub fn create_operation(
        &self,
        op_type: OperationType,
        is_streaming: bool,
    ) -> ActiveOperation {
        ActiveOperation::new(op_type, is_streaming, self.handlers.clone())
    }
}

lazy_static! {
    static ref GLOBAL_CONTROLLER: MetricsController = MetricsController::new(vec![Box::new(
        PrometheusMetricsHandler::new(prometheus::default_registry())
    )]);
}

/// Process-wide controller backed by the default prometheus registry.
/// Created lazily on first use; all other metrics state is per-instance.
pub fn global_controller() -> &'static MetricsController {
    &GLOBAL_CONTROLLER
}
