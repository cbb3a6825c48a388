//! Error types shared by the replication engine, storage and transport.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rpc to {0} timed out")]
    Timeout(String),

    #[error("not leader, current leader: {0:?}")]
    NotLeader(Option<String>),

    #[error("{0} queue is full")]
    QueueFull(&'static str),

    #[error("index {0} has been compacted")]
    Compacted(u64),

    #[error("unknown member: {0}")]
    UnknownMember(String),

    #[error("node is shutting down")]
    Shutdown,

    #[error("config error: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<tonic::transport::Error> for Error {
    fn from(e: tonic::transport::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<tonic::Status> for Error {
    fn from(s: tonic::Status) -> Self {
        Error::Transport(format!("{}: {}", s.code(), s.message()))
    }
}

impl From<Error> for tonic::Status {
    fn from(e: Error) -> Self {
        match e {
            Error::NotLeader(_) => tonic::Status::unavailable(e.to_string()),
            Error::QueueFull(_) => tonic::Status::resource_exhausted(e.to_string()),
            Error::Json(_) => tonic::Status::invalid_argument(e.to_string()),
            Error::Timeout(_) => tonic::Status::deadline_exceeded(e.to_string()),
            _ => tonic::Status::internal(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
