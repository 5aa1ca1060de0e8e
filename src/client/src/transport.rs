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

//! The transport seam between the drivers and the wire.
//!
//! [`TableTransport`] names one method per data-plane RPC. The production
//! implementation dispatches through the channel pool and the generated
//! stub; tests substitute an in-memory implementation and bypass the
//! network entirely.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cellstore_pb::v1 as pb;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::{Error, Result};
use crate::pool::{ChannelPool, RpcScope};
use crate::util::{request_params, REQUEST_PARAMS_HEADER};

/// Item stream of a server-streaming RPC.
pub type ResponseStream<T> = BoxStream<'static, std::result::Result<T, tonic::Status>>;

#[async_trait]
pub trait TableTransport: Send + Sync + 'static {
    async fn read_rows(
        &self,
        request: pb::ReadRowsRequest,
        timeout: Duration,
    ) -> Result<ResponseStream<pb::ReadRowsResponse>>;

    async fn sample_row_keys(
        &self,
        request: pb::SampleRowKeysRequest,
        timeout: Duration,
    ) -> Result<ResponseStream<pb::SampleRowKeysResponse>>;

    async fn mutate_row(
        &self,
        request: pb::MutateRowRequest,
        timeout: Duration,
    ) -> Result<tonic::Response<pb::MutateRowResponse>>;

    async fn mutate_rows(
        &self,
        request: pb::MutateRowsRequest,
        timeout: Duration,
    ) -> Result<ResponseStream<pb::MutateRowsResponse>>;

    async fn check_and_mutate_row(
        &self,
        request: pb::CheckAndMutateRowRequest,
        timeout: Duration,
    ) -> Result<tonic::Response<pb::CheckAndMutateRowResponse>>;

    async fn read_modify_write_row(
        &self,
        request: pb::ReadModifyWriteRowRequest,
        timeout: Duration,
    ) -> Result<tonic::Response<pb::ReadModifyWriteRowResponse>>;

    async fn ping_and_warm(
        &self,
        request: pb::PingAndWarmRequest,
        timeout: Duration,
    ) -> Result<tonic::Response<pb::PingAndWarmResponse>>;
}

/// Builds a tonic request with the per-attempt deadline, the routing header
/// and the optional bearer token attached.
pub(crate) fn prepare_request<T>(
    message: T,
    timeout: Duration,
    route: Option<&str>,
    credentials: Option<&str>,
) -> Result<tonic::Request<T>> {
    let mut request = tonic::Request::new(message);
    request.set_timeout(timeout);
    if let Some(route) = route {
        let value = route
            .parse()
            .map_err(|_| Error::Config(format!("invalid routing header value: {}", route)))?;
        request.metadata_mut().insert(REQUEST_PARAMS_HEADER, value);
    }
    if let Some(token) = credentials {
        let value = format!("Bearer {}", token)
            .parse()
            .map_err(|_| Error::Config("invalid credentials token".to_string()))?;
        request.metadata_mut().insert("authorization", value);
    }
    Ok(request)
}

/// Keeps the RPC tracking scope alive for as long as the stream is.
fn hold_scope<T: Send + 'static>(
    stream: tonic::codec::Streaming<T>,
    scope: RpcScope,
) -> ResponseStream<T> {
    Box::pin(async_stream::stream! {
        let _scope = scope;
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            yield item;
        }
    })
}

/// Production transport: round-robins over the channel pool.
pub struct GrpcTransport {
    pool: Arc<ChannelPool>,
    credentials: Option<String>,
}

impl GrpcTransport {
    pub fn new(pool: Arc<ChannelPool>, credentials: Option<String>) -> Self {
        Self { pool, credentials }
    }
}

#[async_trait]
impl TableTransport for GrpcTransport {
    async fn read_rows(
        &self,
        request: pb::ReadRowsRequest,
        timeout: Duration,
    ) -> Result<ResponseStream<pb::ReadRowsResponse>> {
        let channel = self.pool.next();
        let scope = channel.track_rpc();
        let route = request_params(&request.table_name, &request.app_profile_id);
        let request =
            prepare_request(request, timeout, Some(&route), self.credentials.as_deref())?;
        let response = channel.stub().read_rows(request).await?;
        Ok(hold_scope(response.into_inner(), scope))
    }

    async fn sample_row_keys(
        &self,
        request: pb::SampleRowKeysRequest,
        timeout: Duration,
    ) -> Result<ResponseStream<pb::SampleRowKeysResponse>> {
        let channel = self.pool.next();
        let scope = channel.track_rpc();
        let route = request_params(&request.table_name, &request.app_profile_id);
        let request =
            prepare_request(request, timeout, Some(&route), self.credentials.as_deref())?;
        let response = channel.stub().sample_row_keys(request).await?;
        Ok(hold_scope(response.into_inner(), scope))
    }

    async fn mutate_row(
        &self,
        request: pb::MutateRowRequest,
        timeout: Duration,
    ) -> Result<tonic::Response<pb::MutateRowResponse>> {
        let channel = self.pool.next();
        let _scope = channel.track_rpc();
        let route = request_params(&request.table_name, &request.app_profile_id);
        let request =
            prepare_request(request, timeout, Some(&route), self.credentials.as_deref())?;
        Ok(channel.stub().mutate_row(request).await?)
    }

    async fn mutate_rows(
        &self,
        request: pb::MutateRowsRequest,
        timeout: Duration,
    ) -> Result<ResponseStream<pb::MutateRowsResponse>> {
        let channel = self.pool.next();
        let scope = channel.track_rpc();
        let route = request_params(&request.table_name, &request.app_profile_id);
        let request =
            prepare_request(request, timeout, Some(&route), self.credentials.as_deref())?;
        let response = channel.stub().mutate_rows(request).await?;
        Ok(hold_scope(response.into_inner(), scope))
    }

    async fn check_and_mutate_row(
        &self,
        request: pb::CheckAndMutateRowRequest,
        timeout: Duration,
    ) -> Result<tonic::Response<pb::CheckAndMutateRowResponse>> {
        let channel = self.pool.next();
        let _scope = channel.track_rpc();
        let route = request_params(&request.table_name, &request.app_profile_id);
        let request =
            prepare_request(request, timeout, Some(&route), self.credentials.as_deref())?;
        Ok(channel.stub().check_and_mutate_row(request).await?)
    }

    async fn read_modify_write_row(
        &self,
        request: pb::ReadModifyWriteRowRequest,
        timeout: Duration,
    ) -> Result<tonic::Response<pb::ReadModifyWriteRowResponse>> {
        let channel = self.pool.next();
        let _scope = channel.track_rpc();
        let route = request_params(&request.table_name, &request.app_profile_id);
        let request =
            prepare_request(request, timeout, Some(&route), self.credentials.as_deref())?;
        Ok(channel.stub().read_modify_write_row(request).await?)
    }

    async fn ping_and_warm(
        &self,
        request: pb::PingAndWarmRequest,
        timeout: Duration,
    ) -> Result<tonic::Response<pb::PingAndWarmResponse>> {
        let channel = self.pool.next();
        let _scope = channel.track_rpc();
        let request = prepare_request(request, timeout, None, self.credentials.as_deref())?;
        Ok(channel.stub().ping_and_warm(request).await?)
    }
}
