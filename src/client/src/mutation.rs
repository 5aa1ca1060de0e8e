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

//! Write-side data model: single-row mutations and bulk mutation entries.

use bytes::Bytes;
use cellstore_pb::v1 as pb;
use prost::Message;

use crate::error::{Error, Result};

/// Timestamp sentinel asking the server to substitute its own wall clock.
/// A mutation carrying it is not idempotent and is never retried.
pub const SERVER_SIDE_TIMESTAMP: i64 = -1;

/// Sets one cell. Passing `None` for the timestamp requests server-side time
/// substitution, which makes the mutation non-idempotent.
pub fn set_cell(
    family: impl Into<String>,
    qualifier: impl Into<Bytes>,
    value: impl Into<Bytes>,
    timestamp_micros: Option<i64>,
) -> pb::Mutation {
    pb::Mutation {
        mutation: Some(pb::mutation::Mutation::SetCell(pb::mutation::SetCell {
            family_name: family.into(),
            column_qualifier: qualifier.into(),
            timestamp_micros: timestamp_micros.unwrap_or(SERVER_SIDE_TIMESTAMP),
            value: value.into(),
        })),
    }
}

/// Deletes the cells of one column, optionally restricted to a timestamp
/// range (`0` on either side means unbounded).
pub fn delete_from_column(
    family: impl Into<String>,
    qualifier: impl Into<Bytes>,
    time_range: Option<(i64, i64)>,
) -> pb::Mutation {
    pb::Mutation {
        mutation: Some(pb::mutation::Mutation::DeleteFromColumn(
            pb::mutation::DeleteFromColumn {
                family_name: family.into(),
                column_qualifier: qualifier.into(),
                time_range: time_range.map(|(start, end)| pb::TimestampRange {
                    start_timestamp_micros: start,
                    end_timestamp_micros: end,
                }),
            },
        )),
    }
}

pub fn delete_from_family(family: impl Into<String>) -> pb::Mutation {
    pb::Mutation {
        mutation: Some(pb::mutation::Mutation::DeleteFromFamily(
            pb::mutation::DeleteFromFamily {
                family_name: family.into(),
            },
        )),
    }
}

pub fn delete_from_row() -> pb::Mutation {
    pb::Mutation {
        mutation: Some(pb::mutation::Mutation::DeleteFromRow(
            pb::mutation::DeleteFromRow {},
        )),
    }
}

/// Whether the mutation's outcome is independent of the server's wall clock.
pub fn is_idempotent(mutation: &pb::Mutation) -> bool {
    match &mutation.mutation {
        Some(pb::mutation::Mutation::SetCell(set_cell)) => set_cell.timestamp_micros >= 0,
        Some(_) => true,
        None => false,
    }
}

/// Appends the latest value of one column, creating the cell if absent.
pub fn append_value_rule(
    family: impl Into<String>,
    qualifier: impl Into<Bytes>,
    value: impl Into<Bytes>,
) -> pb::ReadModifyWriteRule {
    pb::ReadModifyWriteRule {
        family_name: family.into(),
        column_qualifier: qualifier.into(),
        rule: Some(pb::read_modify_write_rule::Rule::AppendValue(value.into())),
    }
}

/// Interprets the latest value of one column as a big-endian i64 and adds to
/// it, creating the cell at zero if absent.
pub fn increment_rule(
    family: impl Into<String>,
    qualifier: impl Into<Bytes>,
    amount: i64,
) -> pb::ReadModifyWriteRule {
    pb::ReadModifyWriteRule {
        family_name: family.into(),
        column_qualifier: qualifier.into(),
        rule: Some(pb::read_modify_write_rule::Rule::IncrementAmount(amount)),
    }
}

/// All mutations to apply atomically to one row within a bulk call.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationEntry {
    pub row_key: Bytes,
    pub mutations: Vec<pb::Mutation>,
}

impl MutationEntry {
    /// Fails if `mutations` is empty; an entry must change something.
    pub fn new(row_key: impl Into<Bytes>, mutations: Vec<pb::Mutation>) -> Result<Self> {
        if mutations.is_empty() {
            return Err(Error::Config(
                "a mutation entry must contain at least one mutation".to_string(),
            ));
        }
        Ok(Self {
            row_key: row_key.into(),
            mutations,
        })
    }

    /// True iff every contained mutation carries an explicit timestamp.
    /// Non-idempotent entries are finalized on their first error.
    pub fn is_idempotent(&self) -> bool {
        self.mutations.iter().all(is_idempotent)
    }

    /// Serialized size, used for flow-control byte accounting.
    pub fn byte_size(&self) -> usize {
        self.to_pb().encoded_len()
    }

    pub(crate) fn to_pb(&self) -> pb::mutate_rows_request::Entry {
        pb::mutate_rows_request::Entry {
            row_key: self.row_key.clone(),
            mutations: self.mutations.clone(),
        }
    }
}
