//! Replicated key/value state machine kept consistent across a cluster by
//! a Raft-style consensus engine.

pub mod config;
pub mod error;
pub mod member;
pub mod metrics;
pub mod raft;
pub mod rpc;
pub mod server;
pub mod statemachine;
pub mod util;
pub mod wal;

pub use config::{NodeConfig, RaftConfig, RuntimeConfig};
pub use error::{Error, Result};
pub use raft::Node;
pub use statemachine::{Command, StateMachineOperation, StateMachineResponse};
