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

//! Error types surfaced by the client.
//!
//! Transport failures keep their [`tonic::Status`] so callers (and the retry
//! drivers) can classify them by [`tonic::Code`]. Operations that span
//! multiple attempts or multiple entries aggregate their causes into group
//! errors carrying every member alongside a rendered summary.

use std::fmt;
use std::time::Duration;

use tonic::Code;

use crate::mutation::MutationEntry;
use crate::query::ReadQuery;

pub type Result<T> = std::result::Result<T, Error>;

/// Error categories retried by default for read operations.
pub const READ_RETRYABLE: &[Code] = &[
    Code::DeadlineExceeded,
    Code::Unavailable,
    Code::Aborted,
    Code::ResourceExhausted,
];

/// Error categories retried by default for mutations. Rate-limit pushback is
/// deliberately excluded; callers opt in with their own code set.
pub const MUTATION_RETRYABLE: &[Code] = &[Code::DeadlineExceeded, Code::Unavailable];

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A transport-level failure reported by the service or the channel.
    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    /// The chunk stream violated the wire contract. Never retried.
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    /// The whole-operation deadline elapsed. Carries the cause of every
    /// failed attempt observed along the way.
    #[error("operation deadline of {timeout:?} exceeded: {attempts}")]
    OperationTimeout {
        timeout: Duration,
        attempts: RetryErrorGroup,
    },

    /// One or more retryable failures, aggregated. Used as the cause of a
    /// per-entry failure when an entry was retried more than once.
    #[error("{0}")]
    RetryGroup(RetryErrorGroup),

    #[error(transparent)]
    MutationGroup(#[from] MutationGroupError),

    #[error(transparent)]
    ShardedRead(#[from] ShardedReadError),

    /// A row stream was not polled for longer than its idle period.
    #[error("read stream idle for longer than {0:?}")]
    IdleTimeout(Duration),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// `append` was called on a batcher after `close`.
    #[error("mutations batcher is closed")]
    BatcherClosed,

    /// A single mutation entry exceeds the hard in-flight byte cap.
    #[error("mutation entry of {size} bytes exceeds the in-flight byte cap of {limit} bytes")]
    EntryTooLarge { size: usize, limit: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Transport status code, when this error is (or directly wraps) one.
    pub fn code(&self) -> Option<Code> {
        match self {
            Error::Rpc(status) => Some(status.code()),
            Error::OperationTimeout { .. } | Error::IdleTimeout(_) => {
                Some(Code::DeadlineExceeded)
            }
            Error::Cancelled => Some(Code::Cancelled),
            Error::RetryGroup(group) => group.errors.last().and_then(Error::code),
            _ => None,
        }
    }

    /// Status code used for metrics, falling back to `Unknown`.
    pub(crate) fn metric_code(&self) -> Code {
        self.code().unwrap_or(Code::Unknown)
    }

    /// Whether the retry drivers may try again after observing this error.
    ///
    /// Only transport failures are candidates; everything else (invalid
    /// chunks, exhausted deadlines, group errors) is terminal.
    pub fn is_retryable(&self, retryable_codes: &[Code]) -> bool {
        match self {
            Error::Rpc(status) => retryable_codes.contains(&status.code()),
            _ => false,
        }
    }

    /// Builds the error for one terminal entry from its accumulated attempt
    /// failures: the single cause directly, or a retry group.
    pub(crate) fn from_attempt_errors(mut errors: Vec<Error>) -> Error {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            Error::RetryGroup(RetryErrorGroup { errors })
        }
    }
}

impl From<cellstore_pb::v1::RpcStatus> for Error {
    fn from(status: cellstore_pb::v1::RpcStatus) -> Self {
        Error::Rpc(tonic::Status::new(Code::from(status.code), status.message))
    }
}

/// The causes of every failed attempt of one retried operation, in order.
#[derive(Debug, Clone, Default)]
pub struct RetryErrorGroup {
    pub errors: Vec<Error>,
}

impl RetryErrorGroup {
    pub fn push(&mut self, error: Error) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }
}

impl fmt::Display for RetryErrorGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => write!(f, "no failed attempts"),
            [only] => write!(f, "1 failed attempt: {}", only),
            [.., latest] => write!(
                f,
                "{} failed attempts, latest: {}",
                self.errors.len(),
                latest
            ),
        }
    }
}

impl std::error::Error for RetryErrorGroup {}

/// A single mutation entry that reached a terminal failure in a bulk call.
///
/// `index` is the entry's position in the submitted batch; batcher-surfaced
/// failures clear it because the originating batch is no longer addressable.
#[derive(Debug, Clone)]
pub struct FailedMutationError {
    pub index: Option<usize>,
    pub entry: MutationEntry,
    pub cause: Box<Error>,
}

impl FailedMutationError {
    pub(crate) fn new(index: Option<usize>, entry: MutationEntry, cause: Error) -> Self {
        Self {
            index,
            entry,
            cause: Box::new(cause),
        }
    }
}

impl fmt::Display for FailedMutationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.entry.is_idempotent() {
            "idempotent"
        } else {
            "non-idempotent"
        };
        match self.index {
            Some(idx) => write!(
                f,
                "failed {} mutation entry at index {}: {}",
                kind, idx, self.cause
            ),
            None => write!(f, "failed {} mutation entry: {}", kind, self.cause),
        }
    }
}

impl std::error::Error for FailedMutationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// One per-entry failure for every unsuccessful entry of a bulk mutation.
#[derive(Debug, Clone)]
pub struct MutationGroupError {
    pub failures: Vec<FailedMutationError>,
    pub total_entries: usize,
}

impl fmt::Display for MutationGroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entry_word = if self.total_entries == 1 {
            "entry"
        } else {
            "entries"
        };
        write!(
            f,
            "{} of {} mutation {} failed",
            self.failures.len(),
            self.total_entries,
            entry_word
        )?;
        if let Some(latest) = self.failures.last() {
            write!(f, ", latest: {}", latest)?;
        }
        Ok(())
    }
}

impl std::error::Error for MutationGroupError {}

/// A shard of a fanned-out read that failed, with the query it was running.
#[derive(Debug, Clone)]
pub struct FailedQueryShardError {
    pub index: usize,
    pub query: ReadQuery,
    pub cause: Box<Error>,
}

impl fmt::Display for FailedQueryShardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query shard {} failed: {}", self.index, self.cause)
    }
}

impl std::error::Error for FailedQueryShardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

#[derive(Debug, Clone)]
pub struct ShardedReadError {
    pub failures: Vec<FailedQueryShardError>,
    pub total_shards: usize,
}

impl fmt::Display for ShardedReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} query shards failed",
            self.failures.len(),
            self.total_shards
        )?;
        if let Some(latest) = self.failures.last() {
            write!(f, ", latest: {}", latest)?;
        }
        Ok(())
    }
}

impl std::error::Error for ShardedReadError {}
