//! In-process transport
//!
//! Routes calls straight into the handlers of nodes living in the same
//! process. Hosts can be cut off to simulate partitions, and the most recent
//! calls are traced so callers can inspect the exchanges that took place.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock, Weak};

use super::message::{
    AppendEntryRequest, AppendEntryResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use super::transport::Transport;
use crate::error::{Error, Result};
use crate::raft::Node;

/// One call routed through a [`LocalTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcTrace {
    RequestVote {
        to: String,
        term: u64,
    },
    AppendEntry {
        to: String,
        prev_log_index: u64,
        entries: usize,
    },
    InstallSnapshot {
        to: String,
        last_included_index: u64,
    },
    Relay {
        to: String,
        from: String,
    },
    ForwardResp {
        to: String,
        from: String,
    },
}

const DEFAULT_TRACE_LIMIT: usize = 100_000;

pub struct LocalTransport {
    nodes: RwLock<HashMap<String, Weak<Node>>>,
    isolated: Mutex<HashSet<String>>,
    trace: Mutex<VecDeque<RpcTrace>>,
    trace_limit: usize,
    closed: Mutex<Vec<String>>,
}

impl Default for LocalTransport {
    fn default() -> Self {
        LocalTransport::with_trace_limit(DEFAULT_TRACE_LIMIT)
    }
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalTransport::default())
    }

    /// Keeps only the newest `limit` calls in the trace. Zero disables it.
    pub fn with_trace_limit(limit: usize) -> Self {
        LocalTransport {
            nodes: RwLock::new(HashMap::new()),
            isolated: Mutex::new(HashSet::new()),
            trace: Mutex::new(VecDeque::new()),
            trace_limit: limit,
            closed: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, node: &Arc<Node>) {
        self.nodes
            .write()
            .unwrap()
            .insert(node.host().to_string(), Arc::downgrade(node));
    }

    /// Makes every call to or from `host` fail until [`heal`](Self::heal).
    pub fn isolate(&self, host: &str) {
        self.isolated.lock().unwrap().insert(host.to_string());
    }

    pub fn heal(&self, host: &str) {
        self.isolated.lock().unwrap().remove(host);
    }

    pub fn trace(&self) -> Vec<RpcTrace> {
        self.trace.lock().unwrap().iter().cloned().collect()
    }

    pub fn clear_trace(&self) {
        self.trace.lock().unwrap().clear();
    }

    /// Hosts whose connections were closed, in call order.
    pub fn closed_connections(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    fn route(&self, from: &str, to: &str, call: RpcTrace) -> Result<Arc<Node>> {
        if self.trace_limit > 0 {
            let mut trace = self.trace.lock().unwrap();
            if trace.len() == self.trace_limit {
                trace.pop_front();
            }
            trace.push_back(call);
        }
        {
            let isolated = self.isolated.lock().unwrap();
            if isolated.contains(from) || isolated.contains(to) {
                return Err(Error::Transport(format!("{} unreachable from {}", to, from)));
            }
        }
        self.nodes
            .read()
            .unwrap()
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::UnknownMember(to.to_string()))
    }
}

#[tonic::async_trait]
impl Transport for LocalTransport {
    async fn request_vote(&self, host: &str, req: VoteRequest) -> Result<VoteResponse> {
        let call = RpcTrace::RequestVote {
            to: host.to_string(),
            term: req.term,
        };
        let node = self.route(&req.candidate_id, host, call)?;
        Ok(node.handle_request_vote(req).await)
    }

    async fn append_entry(
        &self,
        host: &str,
        req: AppendEntryRequest,
    ) -> Result<AppendEntryResponse> {
        let call = RpcTrace::AppendEntry {
            to: host.to_string(),
            prev_log_index: req.prev_log_index,
            entries: req.entries.len(),
        };
        let node = self.route(&req.leader_id, host, call)?;
        Ok(node.handle_append_entry(req).await)
    }

    async fn install_snapshot(
        &self,
        host: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let call = RpcTrace::InstallSnapshot {
            to: host.to_string(),
            last_included_index: req.last_included_index,
        };
        let node = self.route(&req.leader_id, host, call)?;
        Ok(node.handle_install_snapshot(req).await)
    }

    async fn relay(&self, host: &str, from: &str, operation: String) -> Result<bool> {
        let call = RpcTrace::Relay {
            to: host.to_string(),
            from: from.to_string(),
        };
        let node = self.route(from, host, call)?;
        Ok(node.handle_relay(from, &operation))
    }

    async fn forward_resp(&self, host: &str, from: &str, response: String) -> Result<bool> {
        let call = RpcTrace::ForwardResp {
            to: host.to_string(),
            from: from.to_string(),
        };
        let node = self.route(from, host, call)?;
        Ok(node.handle_forward_resp(from, &response))
    }

    fn close_connections(&self, host: &str) {
        self.closed.lock().unwrap().push(host.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote_to(host: &str) -> RpcTrace {
        RpcTrace::RequestVote {
            to: host.to_string(),
            term: 1,
        }
    }

    #[test]
    fn trace_keeps_only_newest_calls() {
        let transport = LocalTransport::with_trace_limit(2);
        for host in ["node1", "node2", "node3"] {
            assert!(transport.route("node9", host, vote_to(host)).is_err());
        }
        assert_eq!(transport.trace(), vec![vote_to("node2"), vote_to("node3")]);

        transport.clear_trace();
        assert!(transport.trace().is_empty());
    }

    #[test]
    fn zero_limit_disables_trace() {
        let transport = LocalTransport::with_trace_limit(0);
        assert!(transport.route("node9", "node1", vote_to("node1")).is_err());
        assert!(transport.trace().is_empty());
    }
}
