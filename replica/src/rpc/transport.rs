use super::message::{
    AppendEntryRequest, AppendEntryResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::error::Result;

/// Outbound calls from one node to another, addressed by member host.
///
/// Implementations report transport problems as errors; protocol-level
/// refusals come back as ordinary responses.
#[tonic::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(&self, host: &str, req: VoteRequest) -> Result<VoteResponse>;

    async fn append_entry(&self, host: &str, req: AppendEntryRequest)
        -> Result<AppendEntryResponse>;

    async fn install_snapshot(
        &self,
        host: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;

    /// Hands an encoded operation to the leader; `true` means enqueued.
    async fn relay(&self, host: &str, from: &str, operation: String) -> Result<bool>;

    /// Returns an encoded response to the node that relayed the request;
    /// `true` means the origin processed it.
    async fn forward_resp(&self, host: &str, from: &str, response: String) -> Result<bool>;

    /// Drops pooled connections to `host`; they are re-established lazily.
    fn close_connections(&self, host: &str);
}
