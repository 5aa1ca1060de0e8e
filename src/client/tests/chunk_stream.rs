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

//! Table-driven conformance cases for the chunk stream contract, driven
//! through the public read path: each case is one server stream and either
//! the rows it must produce or the invalid-chunk verdict it must earn.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cellstore_client::transport::{ResponseStream, TableTransport};
use cellstore_client::{Client, Error, ReadQuery, Result};
use cellstore_pb::v1 as pb;

/// Serves exactly one pre-baked response stream, once.
struct OneShotStream {
    responses: Mutex<Option<Vec<pb::ReadRowsResponse>>>,
}

impl OneShotStream {
    fn new(responses: Vec<pb::ReadRowsResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(Some(responses)),
        })
    }
}

#[async_trait]
impl TableTransport for OneShotStream {
    async fn read_rows(
        &self,
        _request: pb::ReadRowsRequest,
        _timeout: Duration,
    ) -> Result<ResponseStream<pb::ReadRowsResponse>> {
        let responses = self
            .responses
            .lock()
            .unwrap()
            .take()
            .expect("the stream may only be read once");
        Ok(Box::pin(futures::stream::iter(
            responses.into_iter().map(Ok),
        )))
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
        _request: pb::MutateRowsRequest,
        _timeout: Duration,
    ) -> Result<ResponseStream<pb::MutateRowsResponse>> {
        unimplemented!()
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

/// Compact chunk builder for the cases below.
#[derive(Default)]
struct ChunkSpec {
    key: &'static [u8],
    family: Option<&'static str>,
    qualifier: Option<&'static [u8]>,
    timestamp: i64,
    labels: &'static [&'static str],
    value: &'static [u8],
    value_size: i32,
    commit: bool,
    reset: bool,
}

fn build(spec: ChunkSpec) -> pb::CellChunk {
    pb::CellChunk {
        row_key: Bytes::from_static(spec.key),
        family_name: spec.family.map(str::to_string),
        qualifier: spec.qualifier.map(Bytes::from_static),
        timestamp_micros: spec.timestamp,
        labels: spec.labels.iter().map(|l| l.to_string()).collect(),
        value: Bytes::from_static(spec.value),
        value_size: spec.value_size,
        reset_row: spec.reset,
        commit_row: spec.commit,
    }
}

/// One cell spelled out fully, committed in one chunk.
fn full_cell(key: &'static [u8], commit: bool) -> pb::CellChunk {
    build(ChunkSpec {
        key,
        family: Some("f"),
        qualifier: Some(b"q"),
        value: b"v",
        commit,
        ..Default::default()
    })
}

/// Expected output: `(row key, [(family, qualifier, timestamp, value)])`.
type ExpectedRow = (&'static [u8], Vec<(&'static str, &'static [u8], i64, &'static [u8])>);

async fn run_case(chunks: Vec<pb::CellChunk>) -> Result<Vec<cellstore_client::Row>> {
    let transport = OneShotStream::new(vec![pb::ReadRowsResponse {
        chunks,
        last_scanned_row_key: Bytes::new(),
    }]);
    let client = Client::mock(transport);
    let table = client.table("i", "t");
    table.read_rows(ReadQuery::new()).await
}

async fn expect_rows(chunks: Vec<pb::CellChunk>, expected: Vec<ExpectedRow>) {
    let rows = run_case(chunks).await.unwrap();
    assert_eq!(rows.len(), expected.len(), "row count mismatch");
    for (row, (key, cells)) in rows.iter().zip(&expected) {
        assert_eq!(row.key().as_ref(), *key);
        assert_eq!(row.len(), cells.len(), "cell count mismatch for {:?}", key);
        for (cell, (family, qualifier, timestamp, value)) in row.cells().iter().zip(cells) {
            assert_eq!(cell.family, *family);
            assert_eq!(cell.qualifier.as_ref(), *qualifier);
            assert_eq!(cell.timestamp_micros, *timestamp);
            assert_eq!(cell.value.as_ref(), *value);
        }
    }
}

async fn expect_invalid(chunks: Vec<pb::CellChunk>) {
    match run_case(chunks).await {
        Err(Error::InvalidChunk(_)) => {}
        other => panic!("expected invalid chunk, got {:?}", other),
    }
}

#[tokio::test]
async fn case_empty_stream_yields_no_rows() {
    expect_rows(vec![], vec![]).await;
}

#[tokio::test]
async fn case_single_cell_row() {
    expect_rows(
        vec![full_cell(b"rk1", true)],
        vec![(b"rk1", vec![("f", b"q", 0, b"v")])],
    )
    .await;
}

#[tokio::test]
async fn case_two_columns_share_family() {
    expect_rows(
        vec![
            build(ChunkSpec {
                key: b"rk1",
                family: Some("a"),
                qualifier: Some(b"c"),
                value: b"1",
                ..Default::default()
            }),
            build(ChunkSpec {
                qualifier: Some(b"d"),
                value: b"2",
                commit: true,
                ..Default::default()
            }),
        ],
        vec![(b"rk1", vec![("a", b"c", 0, b"1"), ("a", b"d", 0, b"2")])],
    )
    .await;
}

#[tokio::test]
async fn case_two_families_in_one_row() {
    expect_rows(
        vec![
            build(ChunkSpec {
                key: b"rk1",
                family: Some("a"),
                qualifier: Some(b"c"),
                value: b"1",
                ..Default::default()
            }),
            build(ChunkSpec {
                family: Some("b"),
                qualifier: Some(b"c"),
                value: b"2",
                commit: true,
                ..Default::default()
            }),
        ],
        vec![(b"rk1", vec![("a", b"c", 0, b"1"), ("b", b"c", 0, b"2")])],
    )
    .await;
}

#[tokio::test]
async fn case_versions_ordered_newest_first() {
    expect_rows(
        vec![
            build(ChunkSpec {
                key: b"rk1",
                family: Some("f"),
                qualifier: Some(b"q"),
                timestamp: 1000,
                value: b"old",
                ..Default::default()
            }),
            build(ChunkSpec {
                timestamp: 2000,
                value: b"new",
                commit: true,
                ..Default::default()
            }),
        ],
        vec![(b"rk1", vec![("f", b"q", 2000, b"new"), ("f", b"q", 1000, b"old")])],
    )
    .await;
}

#[tokio::test]
async fn case_split_cell_across_three_chunks() {
    expect_rows(
        vec![
            build(ChunkSpec {
                key: b"rk1",
                family: Some("f"),
                qualifier: Some(b"q"),
                value: b"ab",
                value_size: 6,
                ..Default::default()
            }),
            build(ChunkSpec {
                value: b"cd",
                value_size: 6,
                ..Default::default()
            }),
            build(ChunkSpec {
                value: b"ef",
                commit: true,
                ..Default::default()
            }),
        ],
        vec![(b"rk1", vec![("f", b"q", 0, b"abcdef")])],
    )
    .await;
}

#[tokio::test]
async fn case_empty_cell_value() {
    expect_rows(
        vec![build(ChunkSpec {
            key: b"rk1",
            family: Some("f"),
            qualifier: Some(b"q"),
            value: b"",
            commit: true,
            ..Default::default()
        })],
        vec![(b"rk1", vec![("f", b"q", 0, b"")])],
    )
    .await;
}

#[tokio::test]
async fn case_two_rows_across_responses() {
    let transport = OneShotStream::new(vec![
        pb::ReadRowsResponse {
            chunks: vec![full_cell(b"rk1", true)],
            last_scanned_row_key: Bytes::new(),
        },
        pb::ReadRowsResponse {
            chunks: vec![full_cell(b"rk2", true)],
            last_scanned_row_key: Bytes::new(),
        },
    ]);
    let client = Client::mock(transport);
    let table = client.table("i", "t");
    let rows = table.read_rows(ReadQuery::new()).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].key().as_ref(), b"rk1");
    assert_eq!(rows[1].key().as_ref(), b"rk2");
}

#[tokio::test]
async fn case_row_split_across_responses() {
    let transport = OneShotStream::new(vec![
        pb::ReadRowsResponse {
            chunks: vec![build(ChunkSpec {
                key: b"rk1",
                family: Some("f"),
                qualifier: Some(b"q"),
                value: b"1",
                ..Default::default()
            })],
            last_scanned_row_key: Bytes::new(),
        },
        pb::ReadRowsResponse {
            chunks: vec![build(ChunkSpec {
                qualifier: Some(b"q2"),
                value: b"2",
                commit: true,
                ..Default::default()
            })],
            last_scanned_row_key: Bytes::new(),
        },
    ]);
    let client = Client::mock(transport);
    let table = client.table("i", "t");
    let rows = table.read_rows(ReadQuery::new()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].len(), 2);
}

#[tokio::test]
async fn case_reset_then_new_row() {
    expect_rows(
        vec![
            build(ChunkSpec {
                key: b"rk1",
                family: Some("f"),
                qualifier: Some(b"q"),
                value: b"doomed",
                ..Default::default()
            }),
            build(ChunkSpec {
                reset: true,
                ..Default::default()
            }),
            full_cell(b"rk2", true),
        ],
        vec![(b"rk2", vec![("f", b"q", 0, b"v")])],
    )
    .await;
}

#[tokio::test]
async fn case_new_row_missing_key_is_invalid() {
    expect_invalid(vec![build(ChunkSpec {
        family: Some("f"),
        qualifier: Some(b"q"),
        value: b"v",
        commit: true,
        ..Default::default()
    })])
    .await;
}

#[tokio::test]
async fn case_family_without_qualifier_is_invalid() {
    expect_invalid(vec![build(ChunkSpec {
        key: b"rk1",
        family: Some("f"),
        value: b"v",
        commit: true,
        ..Default::default()
    })])
    .await;
}

#[tokio::test]
async fn case_qualifier_without_family_is_invalid() {
    expect_invalid(vec![build(ChunkSpec {
        key: b"rk1",
        qualifier: Some(b"q"),
        value: b"v",
        commit: true,
        ..Default::default()
    })])
    .await;
}

#[tokio::test]
async fn case_duplicate_row_key_is_invalid() {
    expect_invalid(vec![full_cell(b"rk1", true), full_cell(b"rk1", true)]).await;
}

#[tokio::test]
async fn case_decreasing_row_keys_are_invalid() {
    expect_invalid(vec![full_cell(b"rk2", true), full_cell(b"rk1", true)]).await;
}

#[tokio::test]
async fn case_commit_mid_split_cell_is_invalid() {
    expect_invalid(vec![build(ChunkSpec {
        key: b"rk1",
        family: Some("f"),
        qualifier: Some(b"q"),
        value: b"frag",
        value_size: 8,
        commit: true,
        ..Default::default()
    })])
    .await;
}

#[tokio::test]
async fn case_reset_carrying_value_is_invalid() {
    expect_invalid(vec![
        build(ChunkSpec {
            key: b"rk1",
            family: Some("f"),
            qualifier: Some(b"q"),
            value: b"v",
            ..Default::default()
        }),
        build(ChunkSpec {
            value: b"extra",
            reset: true,
            ..Default::default()
        }),
    ])
    .await;
}

#[tokio::test]
async fn case_unterminated_row_at_end_of_stream_is_invalid() {
    expect_invalid(vec![build(ChunkSpec {
        key: b"rk1",
        family: Some("f"),
        qualifier: Some(b"q"),
        value: b"v",
        ..Default::default()
    })])
    .await;
}

#[tokio::test]
async fn case_unterminated_split_cell_at_end_of_stream_is_invalid() {
    expect_invalid(vec![build(ChunkSpec {
        key: b"rk1",
        family: Some("f"),
        qualifier: Some(b"q"),
        value: b"frag",
        value_size: 8,
        ..Default::default()
    })])
    .await;
}

#[tokio::test]
async fn case_value_fragment_with_new_qualifier_is_invalid() {
    expect_invalid(vec![
        build(ChunkSpec {
            key: b"rk1",
            family: Some("f"),
            qualifier: Some(b"q"),
            value: b"frag",
            value_size: 8,
            ..Default::default()
        }),
        build(ChunkSpec {
            qualifier: Some(b"q2"),
            value: b"more",
            commit: true,
            ..Default::default()
        }),
    ])
    .await;
}

#[tokio::test]
async fn case_labels_round_trip() {
    let rows = run_case(vec![build(ChunkSpec {
        key: b"rk1",
        family: Some("f"),
        qualifier: Some(b"q"),
        labels: &["allow", "deny"],
        value: b"v",
        commit: true,
        ..Default::default()
    })])
    .await
    .unwrap();
    assert_eq!(rows[0][0].labels, vec!["allow".to_string(), "deny".to_string()]);
}

#[tokio::test]
async fn case_last_scanned_alone_yields_no_rows() {
    let transport = OneShotStream::new(vec![pb::ReadRowsResponse {
        chunks: vec![],
        last_scanned_row_key: Bytes::from_static(b"progress"),
    }]);
    let client = Client::mock(transport);
    let table = client.table("i", "t");
    let rows = table.read_rows(ReadQuery::new()).await.unwrap();
    assert!(rows.is_empty());
}
