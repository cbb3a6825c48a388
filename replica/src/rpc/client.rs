//! gRPC transport implementation
//!
//! This module provides functionality for sending consensus, relay and
//! forward-response calls to other nodes in the cluster.

use std::time::Duration;

use tonic::transport::Channel;

use super::message::{
    AppendEntryRequest, AppendEntryResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use super::pb::raft_service_client::RaftServiceClient;
use super::pb::{self, ForwardRespRequest, RelayRequest};
use super::pool::ConnectionPool;
use super::transport::Transport;
use crate::config::NodeConfig;
use crate::error::Result;

const SNAPSHOT_CHUNK_SIZE: usize = 1 << 20;

/// Transport over tonic clients drawn from a [`ConnectionPool`].
pub struct GrpcTransport {
    pool: ConnectionPool,
    rpc_timeout: Duration,
}

impl GrpcTransport {
    pub fn new(nodes: &[NodeConfig], rpc_timeout: Duration) -> Self {
        GrpcTransport {
            pool: ConnectionPool::new(nodes, rpc_timeout),
            rpc_timeout,
        }
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        request.set_timeout(self.rpc_timeout);
        request
    }

    /// Runs one call on a pooled client. The client goes back to the pool
    /// only when the call succeeded.
    async fn call<T, F, Fut>(&self, host: &str, f: F) -> Result<T>
    where
        F: FnOnce(RaftServiceClient<Channel>) -> Fut,
        Fut: std::future::Future<Output = (RaftServiceClient<Channel>, std::result::Result<T, tonic::Status>)>,
    {
        let client = self.pool.get_connection(host).await?;
        let (client, result) = f(client).await;
        match result {
            Ok(value) => {
                self.pool.put_connection(host, client);
                Ok(value)
            }
            Err(status) => {
                log::debug!("rpc to {} failed: {}", host, status);
                Err(status.into())
            }
        }
    }
}

#[tonic::async_trait]
impl Transport for GrpcTransport {
    async fn request_vote(&self, host: &str, req: VoteRequest) -> Result<VoteResponse> {
        let request = self.request(pb::RequestVoteRequest::from(req));
        self.call(host, |mut client| async move {
            let result = client.request_vote(request).await;
            (client, result.map(|r| VoteResponse::from(r.into_inner())))
        })
        .await
    }

    async fn append_entry(
        &self,
        host: &str,
        req: AppendEntryRequest,
    ) -> Result<AppendEntryResponse> {
        let request = self.request(pb::AppendEntryRequest::from(req));
        self.call(host, |mut client| async move {
            let result = client.append_entry(request).await;
            (client, result.map(|r| AppendEntryResponse::from(r.into_inner())))
        })
        .await
    }

    async fn install_snapshot(
        &self,
        host: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let chunks = req.into_chunks(SNAPSHOT_CHUNK_SIZE);
        self.call(host, |mut client| async move {
            let stream = tokio_stream::iter(chunks);
            let result = client.install_snapshot(stream).await;
            (
                client,
                result.map(|r| InstallSnapshotResponse::from(r.into_inner())),
            )
        })
        .await
    }

    async fn relay(&self, host: &str, from: &str, operation: String) -> Result<bool> {
        let request = self.request(RelayRequest {
            host: from.to_string(),
            operation,
        });
        self.call(host, |mut client| async move {
            let result = client.relay(request).await;
            (client, result.map(|r| r.into_inner().accepted))
        })
        .await
    }

    async fn forward_resp(&self, host: &str, from: &str, response: String) -> Result<bool> {
        let request = self.request(ForwardRespRequest {
            host: from.to_string(),
            state_machine_response: response,
        });
        self.call(host, |mut client| async move {
            let result = client.forward_resp(request).await;
            (client, result.map(|r| r.into_inner().processed_request))
        })
        .await
    }

    fn close_connections(&self, host: &str) {
        self.pool.close_connections(host);
    }
}
