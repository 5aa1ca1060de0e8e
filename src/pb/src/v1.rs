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

//! Messages and client stub for the `cellstore.v1.TableData` service.

use prost::bytes::Bytes;

/// A set of row keys and/or row ranges selected by a read.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RowSet {
    /// Single rows included in the set.
    #[prost(bytes = "bytes", repeated, tag = "1")]
    pub row_keys: ::prost::alloc::vec::Vec<Bytes>,
    /// Contiguous row ranges included in the set.
    #[prost(message, repeated, tag = "2")]
    pub row_ranges: ::prost::alloc::vec::Vec<RowRange>,
}

/// A contiguous range of rows. Either bound may be open, closed or absent.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RowRange {
    #[prost(oneof = "row_range::StartKey", tags = "1, 2")]
    pub start_key: ::core::option::Option<row_range::StartKey>,
    #[prost(oneof = "row_range::EndKey", tags = "3, 4")]
    pub end_key: ::core::option::Option<row_range::EndKey>,
}

pub mod row_range {
    use prost::bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum StartKey {
        #[prost(bytes = "bytes", tag = "1")]
        StartKeyClosed(Bytes),
        #[prost(bytes = "bytes", tag = "2")]
        StartKeyOpen(Bytes),
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum EndKey {
        #[prost(bytes = "bytes", tag = "3")]
        EndKeyOpen(Bytes),
        #[prost(bytes = "bytes", tag = "4")]
        EndKeyClosed(Bytes),
    }
}

/// A filter applied server-side to the cells of each row.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RowFilter {
    #[prost(oneof = "row_filter::Filter", tags = "1, 2, 3")]
    pub filter: ::core::option::Option<row_filter::Filter>,
}

pub mod row_filter {
    /// Applies several filters in sequence.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Chain {
        #[prost(message, repeated, tag = "1")]
        pub filters: ::prost::alloc::vec::Vec<super::RowFilter>,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Filter {
        #[prost(message, tag = "1")]
        Chain(Chain),
        /// Keeps only the first N cells of each row.
        #[prost(int32, tag = "2")]
        CellsPerRowLimitFilter(i32),
        /// Replaces every cell value with the empty string.
        #[prost(bool, tag = "3")]
        StripValueTransformer(bool),
    }
}

/// A half-open microsecond timestamp interval; zero means unbounded.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TimestampRange {
    #[prost(int64, tag = "1")]
    pub start_timestamp_micros: i64,
    #[prost(int64, tag = "2")]
    pub end_timestamp_micros: i64,
}

/// A single change to be applied atomically within one row.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Mutation {
    #[prost(oneof = "mutation::Mutation", tags = "1, 2, 3, 4")]
    pub mutation: ::core::option::Option<mutation::Mutation>,
}

pub mod mutation {
    use prost::bytes::Bytes;

    /// Sets a cell. A `timestamp_micros` of `-1` asks the server to
    /// substitute its own time, which makes the mutation non-idempotent.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SetCell {
        #[prost(string, tag = "1")]
        pub family_name: ::prost::alloc::string::String,
        #[prost(bytes = "bytes", tag = "2")]
        pub column_qualifier: Bytes,
        #[prost(int64, tag = "3")]
        pub timestamp_micros: i64,
        #[prost(bytes = "bytes", tag = "4")]
        pub value: Bytes,
    }

    /// Deletes cells of one column within an optional timestamp range.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeleteFromColumn {
        #[prost(string, tag = "1")]
        pub family_name: ::prost::alloc::string::String,
        #[prost(bytes = "bytes", tag = "2")]
        pub column_qualifier: Bytes,
        #[prost(message, optional, tag = "3")]
        pub time_range: ::core::option::Option<super::TimestampRange>,
    }

    /// Deletes every cell of one column family.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeleteFromFamily {
        #[prost(string, tag = "1")]
        pub family_name: ::prost::alloc::string::String,
    }

    /// Deletes the entire row.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeleteFromRow {}

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Mutation {
        #[prost(message, tag = "1")]
        SetCell(SetCell),
        #[prost(message, tag = "2")]
        DeleteFromColumn(DeleteFromColumn),
        #[prost(message, tag = "3")]
        DeleteFromFamily(DeleteFromFamily),
        #[prost(message, tag = "4")]
        DeleteFromRow(DeleteFromRow),
    }
}

/// A rule applied by `ReadModifyWriteRow` to the latest cell of one column.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadModifyWriteRule {
    #[prost(string, tag = "1")]
    pub family_name: ::prost::alloc::string::String,
    #[prost(bytes = "bytes", tag = "2")]
    pub column_qualifier: Bytes,
    #[prost(oneof = "read_modify_write_rule::Rule", tags = "3, 4")]
    pub rule: ::core::option::Option<read_modify_write_rule::Rule>,
}

pub mod read_modify_write_rule {
    use prost::bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Rule {
        #[prost(bytes = "bytes", tag = "3")]
        AppendValue(Bytes),
        #[prost(int64, tag = "4")]
        IncrementAmount(i64),
    }
}

/// A fragment of a streamed read result. May carry part of a cell, a whole
/// cell, or a row commit/reset signal.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CellChunk {
    /// Set on the first chunk of every row; other chunks of the same row
    /// either repeat it or leave it empty.
    #[prost(bytes = "bytes", tag = "1")]
    pub row_key: Bytes,
    #[prost(string, optional, tag = "2")]
    pub family_name: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bytes = "bytes", optional, tag = "3")]
    pub qualifier: ::core::option::Option<Bytes>,
    #[prost(int64, tag = "4")]
    pub timestamp_micros: i64,
    #[prost(string, repeated, tag = "5")]
    pub labels: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(bytes = "bytes", tag = "6")]
    pub value: Bytes,
    /// When positive, more value fragments follow for the current cell.
    #[prost(int32, tag = "7")]
    pub value_size: i32,
    /// Discards the row accumulated so far.
    #[prost(bool, tag = "8")]
    pub reset_row: bool,
    /// Marks the row accumulated so far as complete.
    #[prost(bool, tag = "9")]
    pub commit_row: bool,
}

/// A fully materialized row, returned by unary row-level RPCs.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRow {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(message, repeated, tag = "2")]
    pub families: ::prost::alloc::vec::Vec<ProtoFamily>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoFamily {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub columns: ::prost::alloc::vec::Vec<ProtoColumn>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoColumn {
    #[prost(bytes = "bytes", tag = "1")]
    pub qualifier: Bytes,
    #[prost(message, repeated, tag = "2")]
    pub cells: ::prost::alloc::vec::Vec<ProtoCell>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoCell {
    #[prost(int64, tag = "1")]
    pub timestamp_micros: i64,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
    #[prost(string, repeated, tag = "3")]
    pub labels: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

/// Per-entry status carried by `MutateRowsResponse`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

/// Routing information attached by the server as a binary response trailer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseParams {
    #[prost(string, optional, tag = "1")]
    pub cluster_id: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "2")]
    pub zone_id: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadRowsRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub app_profile_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub rows: ::core::option::Option<RowSet>,
    #[prost(message, optional, tag = "4")]
    pub filter: ::core::option::Option<RowFilter>,
    /// Zero means no limit.
    #[prost(int64, tag = "5")]
    pub rows_limit: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadRowsResponse {
    #[prost(message, repeated, tag = "1")]
    pub chunks: ::prost::alloc::vec::Vec<CellChunk>,
    /// Scan-progress heartbeat: every row up to and including this key has
    /// been examined server-side, whether or not any chunk was produced.
    #[prost(bytes = "bytes", tag = "2")]
    pub last_scanned_row_key: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SampleRowKeysRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub app_profile_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SampleRowKeysResponse {
    #[prost(bytes = "bytes", tag = "1")]
    pub row_key: Bytes,
    #[prost(int64, tag = "2")]
    pub offset_bytes: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MutateRowRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub app_profile_id: ::prost::alloc::string::String,
    #[prost(bytes = "bytes", tag = "3")]
    pub row_key: Bytes,
    #[prost(message, repeated, tag = "4")]
    pub mutations: ::prost::alloc::vec::Vec<Mutation>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MutateRowResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MutateRowsRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub app_profile_id: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    pub entries: ::prost::alloc::vec::Vec<mutate_rows_request::Entry>,
}

pub mod mutate_rows_request {
    use prost::bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Entry {
        #[prost(bytes = "bytes", tag = "1")]
        pub row_key: Bytes,
        #[prost(message, repeated, tag = "2")]
        pub mutations: ::prost::alloc::vec::Vec<super::Mutation>,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MutateRowsResponse {
    #[prost(message, repeated, tag = "1")]
    pub entries: ::prost::alloc::vec::Vec<mutate_rows_response::Entry>,
}

pub mod mutate_rows_response {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Entry {
        /// Index of the entry in the request this status belongs to.
        #[prost(int64, tag = "1")]
        pub index: i64,
        #[prost(message, optional, tag = "2")]
        pub status: ::core::option::Option<super::RpcStatus>,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckAndMutateRowRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub app_profile_id: ::prost::alloc::string::String,
    #[prost(bytes = "bytes", tag = "3")]
    pub row_key: Bytes,
    #[prost(message, optional, tag = "4")]
    pub predicate_filter: ::core::option::Option<RowFilter>,
    #[prost(message, repeated, tag = "5")]
    pub true_mutations: ::prost::alloc::vec::Vec<Mutation>,
    #[prost(message, repeated, tag = "6")]
    pub false_mutations: ::prost::alloc::vec::Vec<Mutation>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckAndMutateRowResponse {
    #[prost(bool, tag = "1")]
    pub predicate_matched: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadModifyWriteRowRequest {
    #[prost(string, tag = "1")]
    pub table_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub app_profile_id: ::prost::alloc::string::String,
    #[prost(bytes = "bytes", tag = "3")]
    pub row_key: Bytes,
    #[prost(message, repeated, tag = "4")]
    pub rules: ::prost::alloc::vec::Vec<ReadModifyWriteRule>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadModifyWriteRowResponse {
    #[prost(message, optional, tag = "1")]
    pub row: ::core::option::Option<ProtoRow>,
}

/// No-op request used to prepare server-side routing state for an instance.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingAndWarmRequest {
    /// Instance resource name.
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub app_profile_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingAndWarmResponse {}

pub mod table_data_client {
    use tonic::codegen::http::uri::PathAndQuery;
    use tonic::transport::Channel;

    /// Client stub for the `cellstore.v1.TableData` service.
    ///
    /// Cloning the stub is cheap; every clone shares the same channel.
    #[derive(Debug, Clone)]
    pub struct TableDataClient {
        inner: tonic::client::Grpc<Channel>,
    }

    impl TableDataClient {
        pub fn new(channel: Channel) -> Self {
            Self {
                inner: tonic::client::Grpc::new(channel),
            }
        }

        pub async fn read_rows(
            &mut self,
            request: impl tonic::IntoRequest<super::ReadRowsRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::ReadRowsResponse>>,
            tonic::Status,
        > {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/cellstore.v1.TableData/ReadRows");
            self.inner
                .server_streaming(request.into_request(), path, codec)
                .await
        }

        pub async fn sample_row_keys(
            &mut self,
            request: impl tonic::IntoRequest<super::SampleRowKeysRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::SampleRowKeysResponse>>,
            tonic::Status,
        > {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/cellstore.v1.TableData/SampleRowKeys");
            self.inner
                .server_streaming(request.into_request(), path, codec)
                .await
        }

        pub async fn mutate_row(
            &mut self,
            request: impl tonic::IntoRequest<super::MutateRowRequest>,
        ) -> std::result::Result<tonic::Response<super::MutateRowResponse>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/cellstore.v1.TableData/MutateRow");
            self.inner.unary(request.into_request(), path, codec).await
        }

        pub async fn mutate_rows(
            &mut self,
            request: impl tonic::IntoRequest<super::MutateRowsRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::MutateRowsResponse>>,
            tonic::Status,
        > {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/cellstore.v1.TableData/MutateRows");
            self.inner
                .server_streaming(request.into_request(), path, codec)
                .await
        }

        pub async fn check_and_mutate_row(
            &mut self,
            request: impl tonic::IntoRequest<super::CheckAndMutateRowRequest>,
        ) -> std::result::Result<tonic::Response<super::CheckAndMutateRowResponse>, tonic::Status>
        {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/cellstore.v1.TableData/CheckAndMutateRow");
            self.inner.unary(request.into_request(), path, codec).await
        }

        pub async fn read_modify_write_row(
            &mut self,
            request: impl tonic::IntoRequest<super::ReadModifyWriteRowRequest>,
        ) -> std::result::Result<tonic::Response<super::ReadModifyWriteRowResponse>, tonic::Status>
        {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/cellstore.v1.TableData/ReadModifyWriteRow");
            self.inner.unary(request.into_request(), path, codec).await
        }

        pub async fn ping_and_warm(
            &mut self,
            request: impl tonic::IntoRequest<super::PingAndWarmRequest>,
        ) -> std::result::Result<tonic::Response<super::PingAndWarmResponse>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/cellstore.v1.TableData/PingAndWarm");
            self.inner.unary(request.into_request(), path, codec).await
        }

        async fn ready(&mut self) -> std::result::Result<(), tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("transport was not ready: {}", e))
            })
        }
    }
}
