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

//! Built-in prometheus sink for the metrics recorder.

use prometheus::core::{AtomicU64, GenericCounterVec};
use prometheus::{
    exponential_buckets, histogram_opts, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, HistogramVec, Registry,
};

use super::{ActiveOperation, CompletedAttempt, CompletedOperation, MetricsHandler};

/// Collects per-attempt and per-operation measurements into a prometheus
/// registry. Exposition of the registry is up to the embedding process.
pub struct PrometheusMetricsHandler {
    operation_latencies: HistogramVec,
    attempt_latencies: HistogramVec,
    server_latencies: HistogramVec,
    first_response_latencies: HistogramVec,
    retry_count: GenericCounterVec<AtomicU64>,
    connectivity_error_count: GenericCounterVec<AtomicU64>,
}

impl PrometheusMetricsHandler {
    pub fn new(registry: &Registry) -> Self {
        let latency_buckets = exponential_buckets(1.0, 2.0, 16).unwrap();

        let operation_latencies = register_histogram_vec_with_registry!(
            histogram_opts!(
                "cellstore_operation_latencies_ms",
                "End-to-end latency of each logical operation, including retries",
                latency_buckets.clone()
            ),
            &["op", "status", "streaming"],
            registry
        )
        .unwrap();

        let attempt_latencies = register_histogram_vec_with_registry!(
            histogram_opts!(
                "cellstore_attempt_latencies_ms",
                "Latency of each individual rpc attempt",
                latency_buckets.clone()
            ),
            &["op", "status", "streaming"],
            registry
        )
        .unwrap();

        let server_latencies = register_histogram_vec_with_registry!(
            histogram_opts!(
                "cellstore_server_latencies_ms",
                "Server-side latency reported through the server-timing trailer",
                latency_buckets.clone()
            ),
            &["op", "status", "streaming"],
            registry
        )
        .unwrap();

        let first_response_latencies = register_histogram_vec_with_registry!(
            histogram_opts!(
                "cellstore_first_response_latencies_ms",
                "Time until the first streamed response of an attempt",
                latency_buckets
            ),
            &["op", "status"],
            registry
        )
        .unwrap();

        let retry_count = register_int_counter_vec_with_registry!(
            "cellstore_retry_count",
            "Number of attempts issued beyond the first, per operation",
            &["op"],
            registry
        )
        .unwrap();

        let connectivity_error_count = register_int_counter_vec_with_registry!(
            "cellstore_connectivity_error_count",
            "Attempts that finished without reaching the service",
            &["op", "status"],
            registry
        )
        .unwrap();

        Self {
            operation_latencies,
            attempt_latencies,
            server_latencies,
            first_response_latencies,
            retry_count,
            connectivity_error_count,
        }
    }
}

fn status_label(code: tonic::Code) -> String {
    format!("{:?}", code)
}

impl MetricsHandler for PrometheusMetricsHandler {
    fn on_attempt_complete(&self, attempt: &CompletedAttempt, operation: &ActiveOperation) {
        let op = operation.op_type().as_str();
        let status = status_label(attempt.status);
        let streaming = if operation.is_streaming() { "true" } else { "false" };

        self.attempt_latencies
            .with_label_values(&[op, &status, streaming])
            .observe(attempt.duration.as_secs_f64() * 1000.0);
        match attempt.server_latency_ms {
            Some(latency_ms) => {
                self.server_latencies
                    .with_label_values(&[op, &status, streaming])
                    .observe(latency_ms);
            }
            None => {
                // No server-timing trailer means the request never made it
                // to the service frontend.
                self.connectivity_error_count
                    .with_label_values(&[op, &status])
                    .inc();
            }
        }
        if let Some(first_response) = attempt.first_response_latency {
            self.first_response_latencies
                .with_label_values(&[op, &status])
                .observe(first_response.as_secs_f64() * 1000.0);
        }
    }

    fn on_operation_complete(&self, operation: &CompletedOperation) {
        let op = operation.op_type.as_str();
        let status = status_label(operation.final_status);
        let streaming = if operation.is_streaming { "true" } else { "false" };

        self.operation_latencies
            .with_label_values(&[op, &status, streaming])
            .observe(operation.duration.as_secs_f64() * 1000.0);
        if operation.attempts.len() > 1 {
            self.retry_count
                .with_label_values(&[op])
                .inc_by(operation.attempts.len() as u64 - 1);
        }
    }
}

/// Emits one structured log line per completed attempt and operation.
/// Useful for debugging retry behavior without a metrics backend.
#[derive(Default)]
pub struct LogMetricsHandler;

impl MetricsHandler for LogMetricsHandler {
    fn on_attempt_complete(&self, attempt: &CompletedAttempt, operation: &ActiveOperation) {
        tracing::debug!(
            op = operation.op_type().as_str(),
            status = ?attempt.status,
            duration_ms = attempt.duration.as_secs_f64() * 1000.0,
            server_latency_ms = attempt.server_latency_ms,
            backoff_ms = attempt.backoff_before_attempt.as_secs_f64() * 1000.0,
            "rpc attempt complete"
        );
    }

    fn on_operation_complete(&self, operation: &CompletedOperation) {
        tracing::info!(
            op = operation.op_type.as_str(),
            status = ?operation.final_status,
            attempts = operation.attempts.len(),
            duration_ms = operation.duration.as_secs_f64() * 1000.0,
            cluster = %operation.cluster_id,
            zone = %operation.zone,
            "operation complete"
        );
    }
}
