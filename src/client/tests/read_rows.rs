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

//! End-to-end streaming read scenarios over an in-memory transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cellstore_client::transport::{ResponseStream, TableTransport};
use cellstore_client::{CallOptions, Client, Error, ReadQuery, Result, RowRange};
use cellstore_pb::v1 as pb;
use futures::StreamExt;
use tonic::{Code, Status};

/// One scripted read attempt: either the stream items to serve, or an
/// error to fail the call with up front.
type ReadScript = std::result::Result<Vec<std::result::Result<pb::ReadRowsResponse, Status>>, Status>;

struct ScriptedReads {
    scripts: Mutex<VecDeque<ReadScript>>,
    requests: Mutex<Vec<pb::ReadRowsRequest>>,
}

impl ScriptedReads {
    fn new(scripts: Vec<ReadScript>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(vec![]),
        })
    }

    fn requests(&self) -> Vec<pb::ReadRowsRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TableTransport for ScriptedReads {
    async fn read_rows(
        &self,
        request: pb::ReadRowsRequest,
        _timeout: Duration,
    ) -> Result<ResponseStream<pb::ReadRowsResponse>> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected extra read attempt");
        match script {
            Ok(items) => Ok(Box::pin(futures::stream::iter(items))),
            Err(status) => Err(Error::Rpc(status)),
        }
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

fn committed_row(key: &[u8]) -> pb::CellChunk {
    pb::CellChunk {
        row_key: Bytes::copy_from_slice(key),
        family_name: Some("f".to_string()),
        qualifier: Some(Bytes::from_static(b"q")),
        timestamp_micros: 0,
        labels: vec![],
        value: Bytes::from_static(b"v"),
        value_size: 0,
        reset_row: false,
        commit_row: true,
    }
}

fn response(chunks: Vec<pb::CellChunk>) -> pb::ReadRowsResponse {
    pb::ReadRowsResponse {
        chunks,
        last_scanned_row_key: Bytes::new(),
    }
}

fn keys(rows: &[cellstore_client::Row]) -> Vec<&[u8]> {
    rows.iter().map(|row| row.key().as_ref()).collect()
}

#[tokio::test]
async fn test_simple_two_row_read() {
    let transport = ScriptedReads::new(vec![Ok(vec![Ok(response(vec![
        committed_row(b"r1"),
        committed_row(b"r2"),
    ]))])]);
    let client = Client::mock(transport.clone());
    let table = client.table("i", "t");

    let rows = table.read_rows(ReadQuery::new()).await.unwrap();
    assert_eq!(keys(&rows), vec![&b"r1"[..], &b"r2"[..]]);
    assert_eq!(rows[0].cells().len(), 1);
    assert_eq!(rows[0][0].family, "f");
    assert_eq!(rows[0][0].value.as_ref(), b"v");

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].table_name, "projects/mock-project/instances/i/tables/t");
}

#[tokio::test]
async fn test_retry_excludes_delivered_rows_and_drops_stale() {
    // Attempt 1 delivers r1 then dies retryably; attempt 2 re-sends a stale
    // r0 (dropped) and r2. The caller sees r1, r2 exactly once each.
    let transport = ScriptedReads::new(vec![
        Ok(vec![
            Ok(response(vec![committed_row(b"r1")])),
            Err(Status::unavailable("stream broke")),
        ]),
        Ok(vec![Ok(response(vec![
            committed_row(b"r0"),
            committed_row(b"r2"),
        ]))]),
    ]);
    let client = Client::mock(transport.clone());
    let table = client.table("i", "t");

    let rows = table.read_rows(ReadQuery::new()).await.unwrap();
    assert_eq!(keys(&rows), vec![&b"r1"[..], &b"r2"[..]]);

    // The second attempt's request resumes open-after-r1.
    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    let revised = requests[1].rows.as_ref().unwrap();
    assert!(revised.row_keys.is_empty());
    assert_eq!(
        revised.row_ranges[0].start_key,
        Some(pb::row_range::StartKey::StartKeyOpen(Bytes::from_static(
            b"r1"
        )))
    );
}

#[tokio::test]
async fn test_row_limit_carries_across_retries() {
    // limit=3: attempt 1 yields a, b then fails; attempt 2 must ask for
    // exactly one more row, and no third attempt happens.
    let transport = ScriptedReads::new(vec![
        Ok(vec![
            Ok(response(vec![committed_row(b"a"), committed_row(b"b")])),
            Err(Status::unavailable("stream broke")),
        ]),
        Ok(vec![Ok(response(vec![committed_row(b"c")]))]),
    ]);
    let client = Client::mock(transport.clone());
    let table = client.table("i", "t");

    let rows = table
        .read_rows(ReadQuery::new().with_limit(3))
        .await
        .unwrap();
    assert_eq!(keys(&rows), vec![&b"a"[..], &b"b"[..], &b"c"[..]]);

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].rows_limit, 3);
    assert_eq!(requests[1].rows_limit, 1);
}

#[tokio::test]
async fn test_watermark_covering_whole_query_ends_without_second_request() {
    // The only requested key was delivered before the retryable failure, so
    // the revision leaves nothing to read and the retry issues no RPC.
    let transport = ScriptedReads::new(vec![Ok(vec![
        Ok(response(vec![committed_row(b"a")])),
        Err(Status::unavailable("stream broke")),
    ])]);
    let client = Client::mock(transport.clone());
    let table = client.table("i", "t");

    let rows = table
        .read_rows(ReadQuery::new().with_key(&b"a"[..]))
        .await
        .unwrap();
    assert_eq!(keys(&rows), vec![&b"a"[..]]);
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn test_last_scanned_advances_retry_start() {
    // A scan-progress heartbeat moves the watermark without emitting rows,
    // and the retry resumes past it.
    let transport = ScriptedReads::new(vec![
        Ok(vec![
            Ok(pb::ReadRowsResponse {
                chunks: vec![],
                last_scanned_row_key: Bytes::from_static(b"m"),
            }),
            Err(Status::unavailable("stream broke")),
        ]),
        Ok(vec![Ok(response(vec![committed_row(b"n")]))]),
    ]);
    let client = Client::mock(transport.clone());
    let table = client.table("i", "t");

    let rows = table
        .read_rows(ReadQuery::new().with_range(RowRange::unbounded()))
        .await
        .unwrap();
    assert_eq!(keys(&rows), vec![&b"n"[..]]);
    let requests = transport.requests();
    assert_eq!(
        requests[1].rows.as_ref().unwrap().row_ranges[0].start_key,
        Some(pb::row_range::StartKey::StartKeyOpen(Bytes::from_static(
            b"m"
        )))
    );
}

#[tokio::test]
async fn test_non_retryable_error_surfaces_immediately() {
    let transport = ScriptedReads::new(vec![Err(Status::permission_denied("nope"))]);
    let client = Client::mock(transport.clone());
    let table = client.table("i", "t");

    let result = table.read_rows(ReadQuery::new()).await;
    match result {
        Err(Error::Rpc(status)) => assert_eq!(status.code(), Code::PermissionDenied),
        other => panic!("expected rpc error, got {:?}", other),
    }
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn test_invalid_chunk_is_terminal() {
    // A chunk with no row key in AWAITING_NEW_ROW breaks the contract.
    let bad_chunk = pb::CellChunk {
        row_key: Bytes::new(),
        family_name: Some("f".to_string()),
        qualifier: Some(Bytes::from_static(b"q")),
        timestamp_micros: 0,
        labels: vec![],
        value: Bytes::from_static(b"v"),
        value_size: 0,
        reset_row: false,
        commit_row: true,
    };
    let transport = ScriptedReads::new(vec![Ok(vec![Ok(response(vec![bad_chunk]))])]);
    let client = Client::mock(transport.clone());
    let table = client.table("i", "t");

    let result = table.read_rows(ReadQuery::new()).await;
    assert!(matches!(result, Err(Error::InvalidChunk(_))));
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn test_operation_deadline_attaches_attempt_causes() {
    let transport = ScriptedReads::new(
        (0..64)
            .map(|_| Err(Status::unavailable("always down")))
            .collect(),
    );
    let client = Client::mock(transport);
    let table = client.table("i", "t");

    let result = table
        .read_rows_with(
            ReadQuery::new(),
            CallOptions {
                operation_timeout: Some(Duration::from_millis(60)),
                ..Default::default()
            },
        )
        .await;
    match result {
        Err(Error::OperationTimeout { attempts, .. }) => assert!(!attempts.is_empty()),
        other => panic!("expected operation timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_idle_stream_times_out() {
    let transport = ScriptedReads::new(vec![Ok(vec![
        Ok(response(vec![committed_row(b"r1")])),
        // The server keeps the stream open without further data.
    ])]);
    let client = Client::mock(transport);
    let table = client.table("i", "t");

    let mut stream = table
        .read_rows_stream_with(
            ReadQuery::new(),
            CallOptions {
                idle_timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.key().as_ref(), b"r1");

    tokio::time::sleep(Duration::from_millis(120)).await;
    match stream.next().await {
        Some(Err(Error::IdleTimeout(_))) => {}
        other => panic!("expected idle timeout, got {:?}", other),
    }
    // The stream is terminal after the idle failure.
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let transport = ScriptedReads::new(vec![Ok(vec![Ok(response(vec![committed_row(b"r1")]))])]);
    let client = Client::mock(transport);
    let table = client.table("i", "t");

    let mut stream = table.read_rows_stream(ReadQuery::new()).unwrap();
    stream.cancel();
    stream.cancel();
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_sharded_read_aggregates_partial_failures() {
    // Two shards: the first succeeds, the second dies non-retryably.
    let transport = ScriptedReads::new(vec![
        Ok(vec![Ok(response(vec![committed_row(b"a")]))]),
        Err(Status::not_found("missing shard")),
    ]);
    let client = Client::mock(transport);
    let table = client.table("i", "t");

    let shards = vec![
        ReadQuery::new().with_range(RowRange::closed_open(&b"a"[..], &b"m"[..])),
        ReadQuery::new().with_range(RowRange::closed_open(&b"m"[..], &b"z"[..])),
    ];
    let result = table.read_rows_sharded(shards).await;
    match result {
        Err(Error::ShardedRead(group)) => {
            assert_eq!(group.total_shards, 2);
            assert_eq!(group.failures.len(), 1);
            assert_eq!(group.failures[0].index, 1);
            assert_eq!(group.failures[0].cause.code(), Some(Code::NotFound));
        }
        other => panic!("expected sharded read group, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sharded_read_concatenates_in_query_order() {
    let transport = ScriptedReads::new(vec![
        Ok(vec![Ok(response(vec![committed_row(b"a")]))]),
        Ok(vec![Ok(response(vec![committed_row(b"m")]))]),
    ]);
    let client = Client::mock(transport);
    let table = client.table("i", "t");

    let shards = vec![
        ReadQuery::new().with_range(RowRange::closed_open(&b"a"[..], &b"m"[..])),
        ReadQuery::new().with_range(RowRange::closed_open(&b"m"[..], &b"z"[..])),
    ];
    let rows = table.read_rows_sharded(shards).await.unwrap();
    assert_eq!(keys(&rows), vec![&b"a"[..], &b"m"[..]]);
}

#[tokio::test]
async fn test_row_exists_uses_stripping_filter() {
    let transport = ScriptedReads::new(vec![
        Ok(vec![Ok(response(vec![committed_row(b"r1")]))]),
        Ok(vec![]),
    ]);
    let client = Client::mock(transport.clone());
    let table = client.table("i", "t");

    assert!(table.row_exists(&b"r1"[..]).await.unwrap());
    assert!(!table.row_exists(&b"gone"[..]).await.unwrap());

    let requests = transport.requests();
    assert_eq!(requests[0].rows_limit, 1);
    let filter = requests[0].filter.as_ref().unwrap();
    match filter.filter.as_ref().unwrap() {
        pb::row_filter::Filter::Chain(chain) => assert_eq!(chain.filters.len(), 2),
        other => panic!("expected filter chain, got {:?}", other),
    }
}

#[tokio::test]
async fn test_read_row_returns_none_when_absent() {
    let transport = ScriptedReads::new(vec![Ok(vec![])]);
    let client = Client::mock(transport);
    let table = client.table("i", "t");
    assert!(table.read_row(&b"nope"[..], None).await.unwrap().is_none());
}
