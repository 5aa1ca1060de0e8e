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

//! Data-plane client for the cellstore wide-column table service.
//!
//! The client maintains a pool of long-lived channels that are refreshed on
//! a jittered schedule, streams reads through a retrying chunk-to-row
//! pipeline, executes bulk mutations with per-entry retry tracking, and
//! offers a flow-controlled batcher for high-volume writes.

#![warn(clippy::dbg_macro)]
#![warn(clippy::explicit_into_iter_loop)]
#![warn(clippy::explicit_iter_loop)]
#![warn(clippy::inconsistent_struct_constructor)]
#![warn(clippy::map_flatten)]
#![warn(clippy::await_holding_lock)]

pub mod batcher;
pub mod client;
pub mod config;
pub mod error;
pub mod flow_control;
mod merger;
pub mod metrics;
mod mutate_rows;
pub mod mutation;
pub mod pool;
pub mod query;
mod read_rows;
pub mod refresh;
pub mod row;
pub mod transport;
mod util;

pub use batcher::{BatcherConfig, MutationsBatcher};
pub use client::{CallOptions, Client, InstanceKey, Table, TableOptions};
pub use config::ClientConfig;
pub use error::{
    Error, FailedMutationError, FailedQueryShardError, MutationGroupError, Result,
    RetryErrorGroup, ShardedReadError, MUTATION_RETRYABLE, READ_RETRYABLE,
};
pub use mutate_rows::TerminalCallback;
pub use mutation::MutationEntry;
pub use query::{filters, RangePoint, ReadQuery, RowRange};
pub use read_rows::RowStream;
pub use row::{Cell, Row};
