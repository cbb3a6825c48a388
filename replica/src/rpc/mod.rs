//! Node-to-node communication
//!
//! The consensus engine talks to its peers through the [`Transport`] trait.
//! [`GrpcTransport`] is the production implementation backed by tonic and a
//! [`ConnectionPool`]; [`LocalTransport`] wires nodes of one process together.

mod client;
mod local;
mod message;
mod pool;
mod service;
mod transport;

pub mod pb {
    tonic::include_proto!("raft");
}

pub use client::GrpcTransport;
pub use local::{LocalTransport, RpcTrace};
pub use message::{
    AppendEntryRequest, AppendEntryResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
pub use pool::ConnectionPool;
pub use service::RaftServiceSVC;
pub use transport::Transport;
