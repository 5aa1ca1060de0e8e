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

//! Read queries: row key sets, row ranges, filters, limits, and sharding.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use cellstore_pb::v1 as pb;

use crate::error::{Error, Result};

/// One bound of a row range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangePoint {
    pub key: Bytes,
    pub inclusive: bool,
}

impl RangePoint {
    pub fn closed(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            inclusive: true,
        }
    }

    pub fn open(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            inclusive: false,
        }
    }
}

/// A contiguous range of row keys; either bound may be absent (unbounded).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct RowRange {
    pub start: Option<RangePoint>,
    pub end: Option<RangePoint>,
}

impl RowRange {
    pub fn new(start: Option<RangePoint>, end: Option<RangePoint>) -> Self {
        Self { start, end }
    }

    /// The conventional `[start, end)` range.
    pub fn closed_open(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            start: Some(RangePoint::closed(start)),
            end: Some(RangePoint::open(end)),
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub(crate) fn to_pb(&self) -> pb::RowRange {
        use pb::row_range::{EndKey, StartKey};
        pb::RowRange {
            start_key: self.start.as_ref().map(|p| {
                if p.inclusive {
                    StartKey::StartKeyClosed(p.key.clone())
                } else {
                    StartKey::StartKeyOpen(p.key.clone())
                }
            }),
            end_key: self.end.as_ref().map(|p| {
                if p.inclusive {
                    EndKey::EndKeyClosed(p.key.clone())
                } else {
                    EndKey::EndKeyOpen(p.key.clone())
                }
            }),
        }
    }
}

/// Constructors for the server-side row filters the client itself composes.
pub mod filters {
    use cellstore_pb::v1 as pb;

    pub fn chain(filters: Vec<pb::RowFilter>) -> pb::RowFilter {
        pb::RowFilter {
            filter: Some(pb::row_filter::Filter::Chain(pb::row_filter::Chain {
                filters,
            })),
        }
    }

    pub fn cells_per_row_limit(limit: i32) -> pb::RowFilter {
        pb::RowFilter {
            filter: Some(pb::row_filter::Filter::CellsPerRowLimitFilter(limit)),
        }
    }

    pub fn strip_value() -> pb::RowFilter {
        pb::RowFilter {
            filter: Some(pb::row_filter::Filter::StripValueTransformer(true)),
        }
    }
}

/// Describes which rows a read returns.
///
/// An empty query (no keys, no ranges) scans the whole table. Keys are kept
/// deduplicated and sorted; ranges are sent as given.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ReadQuery {
    keys: BTreeSet<Bytes>,
    ranges: Vec<RowRange>,
    filter: Option<pb::RowFilter>,
    limit: Option<u64>,
}

impl ReadQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.keys.insert(key.into());
        self
    }

    pub fn with_range(mut self, range: RowRange) -> Self {
        self.ranges.push(range);
        self
    }

    pub fn with_filter(mut self, filter: pb::RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Caps the number of rows returned. `Some(0)` yields an empty result
    /// without issuing an RPC.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.ranges.is_empty()
    }

    pub(crate) fn to_pb(&self, table_name: &str, app_profile_id: &str) -> pb::ReadRowsRequest {
        pb::ReadRowsRequest {
            table_name: table_name.to_string(),
            app_profile_id: app_profile_id.to_string(),
            rows: Some(pb::RowSet {
                row_keys: self.keys.iter().cloned().collect(),
                row_ranges: self.ranges.iter().map(RowRange::to_pb).collect(),
            }),
            filter: self.filter.clone(),
            rows_limit: self.limit.unwrap_or(0) as i64,
        }
    }

    /// Splits this query into per-section queries along row key samples, so
    /// the sections can be read in parallel against separate backend nodes.
    ///
    /// Each sample key delimits a section that ends at it, inclusive; keys
    /// beyond the last sample fall into a final catch-all section. Queries
    /// with a limit cannot be sharded.
    pub fn shard(&self, samples: &[(Bytes, i64)]) -> Result<Vec<ReadQuery>> {
        if self.limit.is_some() {
            return Err(Error::Config(
                "a query with a row limit cannot be sharded".to_string(),
            ));
        }
        let split_points: Vec<&Bytes> =
            samples.iter().map(|(k, _)| k).filter(|k| !k.is_empty()).collect();

        fn shard_at<'a>(
            shards: &'a mut BTreeMap<usize, ReadQuery>,
            filter: &Option<pb::RowFilter>,
            idx: usize,
        ) -> &'a mut ReadQuery {
            shards.entry(idx).or_insert_with(|| ReadQuery {
                filter: filter.clone(),
                ..Default::default()
            })
        }

        let mut shards: BTreeMap<usize, ReadQuery> = BTreeMap::new();

        // Section i owns keys k with split[i-1] < k <= split[i]; the last
        // section owns everything above the final split point.
        for key in &self.keys {
            let idx = split_points.partition_point(|p| *p < key);
            shard_at(&mut shards, &self.filter, idx).keys.insert(key.clone());
        }

        for range in &self.ranges {
            let start_index = match &range.start {
                None => 0,
                Some(p) if p.inclusive => split_points.partition_point(|s| **s < p.key),
                Some(p) => split_points.partition_point(|s| **s <= p.key),
            };
            let end_index = match &range.end {
                None => split_points.len(),
                Some(p) => split_points.partition_point(|s| **s < p.key),
            };
            if start_index >= end_index {
                shard_at(&mut shards, &self.filter, start_index)
                    .ranges
                    .push(range.clone());
                continue;
            }
            // The range spans several sections: clip the first and last
            // pieces to the original bounds and fill the middle with
            // (split[i-1], split[i]] segments.
            shard_at(&mut shards, &self.filter, start_index)
                .ranges
                .push(RowRange {
                    start: range.start.clone(),
                    end: Some(RangePoint::closed(split_points[start_index].clone())),
                });
            for idx in start_index + 1..end_index {
                shard_at(&mut shards, &self.filter, idx).ranges.push(RowRange {
                    start: Some(RangePoint::open(split_points[idx - 1].clone())),
                    end: Some(RangePoint::closed(split_points[idx].clone())),
                });
            }
            shard_at(&mut shards, &self.filter, end_index)
                .ranges
                .push(RowRange {
                    start: Some(RangePoint::open(split_points[end_index - 1].clone())),
                    end: range.end.clone(),
                });
        }

        Ok(shards.into_values().collect())
    }
}
