use std::sync::Arc;

use super::message::{AppendEntryRequest, InstallSnapshotRequest, VoteRequest};
use super::pb::raft_service_server::RaftService;
use super::pb::{
    AppendEntryResponse, ForwardRespRequest, ForwardRespResponse, InstallSnapshotResponse,
    RelayRequest, RelayResponse, RequestVoteRequest, RequestVoteResponse, SnapshotChunk,
    SubmitRequest, SubmitResponse,
};
use crate::metrics;
use crate::raft::Node;
use crate::statemachine::StateMachineOperation;

/// gRPC front of a [`Node`].
pub struct RaftServiceSVC {
    node: Arc<Node>,
}

impl RaftServiceSVC {
    pub fn new(node: Arc<Node>) -> Self {
        RaftServiceSVC { node }
    }
}

#[tonic::async_trait]
impl RaftService for RaftServiceSVC {
    async fn request_vote(
        &self,
        request: tonic::Request<RequestVoteRequest>,
    ) -> Result<tonic::Response<RequestVoteResponse>, tonic::Status> {
        metrics::record_metrics("request_vote", || async move {
            let req = VoteRequest::from(request.into_inner());
            let resp = self.node.handle_request_vote(req).await;
            Ok(tonic::Response::new(RequestVoteResponse::from(resp)))
        })
        .await
    }

    async fn append_entry(
        &self,
        request: tonic::Request<super::pb::AppendEntryRequest>,
    ) -> Result<tonic::Response<AppendEntryResponse>, tonic::Status> {
        metrics::record_metrics("append_entry", || async move {
            let req = AppendEntryRequest::from(request.into_inner());
            let resp = self.node.handle_append_entry(req).await;
            Ok(tonic::Response::new(AppendEntryResponse::from(resp)))
        })
        .await
    }

    async fn install_snapshot(
        &self,
        request: tonic::Request<tonic::Streaming<SnapshotChunk>>,
    ) -> Result<tonic::Response<InstallSnapshotResponse>, tonic::Status> {
        metrics::record_metrics("install_snapshot", || async move {
            let mut stream = request.into_inner();
            let mut chunks = Vec::new();
            while let Some(chunk) = stream.message().await? {
                chunks.push(chunk);
            }
            let req = InstallSnapshotRequest::from_chunks(chunks)
                .ok_or_else(|| tonic::Status::invalid_argument("empty snapshot stream"))?;
            let resp = self.node.handle_install_snapshot(req).await;
            Ok(tonic::Response::new(InstallSnapshotResponse::from(resp)))
        })
        .await
    }

    async fn relay(
        &self,
        request: tonic::Request<RelayRequest>,
    ) -> Result<tonic::Response<RelayResponse>, tonic::Status> {
        metrics::record_metrics("relay", || async move {
            let req = request.into_inner();
            let accepted = self.node.handle_relay(&req.host, &req.operation);
            Ok(tonic::Response::new(RelayResponse { accepted }))
        })
        .await
    }

    async fn forward_resp(
        &self,
        request: tonic::Request<ForwardRespRequest>,
    ) -> Result<tonic::Response<ForwardRespResponse>, tonic::Status> {
        metrics::record_metrics("forward_resp", || async move {
            let req = request.into_inner();
            let processed_request = self
                .node
                .handle_forward_resp(&req.host, &req.state_machine_response);
            Ok(tonic::Response::new(ForwardRespResponse { processed_request }))
        })
        .await
    }

    async fn submit(
        &self,
        request: tonic::Request<SubmitRequest>,
    ) -> Result<tonic::Response<SubmitResponse>, tonic::Status> {
        metrics::record_metrics("submit", || async move {
            let op = StateMachineOperation::decode(&request.into_inner().operation)?;
            let response = self.node.submit_operation(op).await?;
            Ok(tonic::Response::new(SubmitResponse {
                state_machine_response: response.encode()?,
            }))
        })
        .await
    }
}
