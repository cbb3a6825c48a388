//! Cluster member records
//!
//! Every node keeps one record per cluster member, itself included. The
//! table is built once at bootstrap and never changes shape; each record
//! guards its mutable fields with its own lock so replication workers for
//! different followers never contend with each other.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;

/// Role or liveness of a member as seen by the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Status {
    Leader,
    Candidate,
    #[default]
    Follower,
    /// No replication exchange in flight.
    Ready,
    /// A replication exchange is in flight.
    Busy,
    /// Connection attempts exhausted their retries.
    Dead,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Leader => "leader",
            Status::Candidate => "candidate",
            Status::Follower => "follower",
            Status::Ready => "ready",
            Status::Busy => "busy",
            Status::Dead => "dead",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberState {
    pub status: Status,
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub next_index: u64,
    pub match_index: u64,
}

#[derive(Debug)]
pub struct Member {
    pub host: String,
    pub addr: String,
    state: Mutex<MemberState>,
}

impl Member {
    pub fn new(host: impl Into<String>, addr: impl Into<String>) -> Self {
        Member {
            host: host.into(),
            addr: addr.into(),
            state: Mutex::new(MemberState {
                next_index: 1,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemberState> {
        // A poisoned record still holds consistent plain data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> MemberState {
        self.lock().clone()
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    pub fn set_status(&self, status: Status) {
        self.lock().status = status;
    }

    pub fn next_index(&self) -> u64 {
        self.lock().next_index
    }

    pub fn match_index(&self) -> u64 {
        self.lock().match_index
    }

    pub fn current_term(&self) -> u64 {
        self.lock().current_term
    }

    pub fn voted_for(&self) -> Option<String> {
        self.lock().voted_for.clone()
    }

    pub fn set_term(&self, term: u64, voted_for: Option<String>) {
        let mut state = self.lock();
        state.current_term = term;
        state.voted_for = voted_for;
    }

    /// Resets the leader's bookkeeping for this follower after an election.
    pub fn reset_progress(&self, next_index: u64) {
        let mut state = self.lock();
        state.next_index = next_index.max(1);
        state.match_index = 0;
        state.status = Status::Ready;
    }

    /// Records a successful append covering entries up to `match_index`.
    /// Never moves `match_index` backwards.
    pub fn record_match(&self, match_index: u64) {
        let mut state = self.lock();
        if match_index > state.match_index {
            state.match_index = match_index;
        }
        state.next_index = state.match_index + 1;
    }

    /// Backs off one entry after a log mismatch.
    pub fn decrement_next(&self) -> u64 {
        let mut state = self.lock();
        if state.next_index > 1 {
            state.next_index -= 1;
        }
        if state.match_index >= state.next_index {
            state.match_index = state.next_index - 1;
        }
        state.next_index
    }

    pub fn set_next_index(&self, next_index: u64) {
        let mut state = self.lock();
        state.next_index = next_index.max(1);
        if state.match_index >= state.next_index {
            state.match_index = state.next_index - 1;
        }
    }
}

/// Host-keyed table of member records.
#[derive(Debug, Clone)]
pub struct Membership {
    local: String,
    members: Arc<HashMap<String, Arc<Member>>>,
}

impl Membership {
    pub fn new(local: impl Into<String>, nodes: &[NodeConfig]) -> Self {
        let local = local.into();
        let members = nodes
            .iter()
            .map(|n| (n.host.clone(), Arc::new(Member::new(&n.host, &n.addr))))
            .collect();
        Membership {
            local,
            members: Arc::new(members),
        }
    }

    pub fn local_host(&self) -> &str {
        &self.local
    }

    pub fn local(&self) -> Option<&Arc<Member>> {
        self.members.get(&self.local)
    }

    pub fn get(&self, host: &str) -> Option<&Arc<Member>> {
        self.members.get(host)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Every member except the local node.
    pub fn peers(&self) -> impl Iterator<Item = &Arc<Member>> {
        self.members.values().filter(move |m| m.host != self.local)
    }

    /// Strict majority of the full membership.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(n: usize) -> Vec<NodeConfig> {
        (1..=n)
            .map(|i| NodeConfig {
                host: format!("node{}", i),
                addr: format!("127.0.0.1:40{:02}", i),
            })
            .collect()
    }

    #[test]
    fn quorum_is_strict_majority() {
        assert_eq!(Membership::new("node1", &nodes(1)).quorum(), 1);
        assert_eq!(Membership::new("node1", &nodes(3)).quorum(), 2);
        assert_eq!(Membership::new("node1", &nodes(4)).quorum(), 3);
        assert_eq!(Membership::new("node1", &nodes(5)).quorum(), 3);
    }

    #[test]
    fn peers_exclude_local() {
        let membership = Membership::new("node2", &nodes(3));
        let mut peers: Vec<_> = membership.peers().map(|m| m.host.clone()).collect();
        peers.sort();
        assert_eq!(peers, vec!["node1", "node3"]);
        assert_eq!(membership.local().unwrap().host, "node2");
    }

    #[test]
    fn progress_keeps_match_below_next() {
        let member = Member::new("node2", "127.0.0.1:4002");
        member.reset_progress(6);
        assert_eq!(member.next_index(), 6);
        assert_eq!(member.match_index(), 0);

        member.record_match(4);
        assert_eq!(member.match_index(), 4);
        assert_eq!(member.next_index(), 5);

        // stale success responses do not regress the match index
        member.record_match(2);
        assert_eq!(member.match_index(), 4);

        member.decrement_next();
        assert_eq!(member.next_index(), 4);
        assert_eq!(member.match_index(), 3);
    }

    #[test]
    fn next_index_never_drops_below_one() {
        let member = Member::new("node2", "127.0.0.1:4002");
        member.reset_progress(1);
        assert_eq!(member.decrement_next(), 1);
        member.set_next_index(0);
        assert_eq!(member.next_index(), 1);
    }

    #[test]
    fn status_transitions() {
        let member = Member::new("node2", "127.0.0.1:4002");
        assert_eq!(member.status(), Status::Follower);
        member.set_status(Status::Busy);
        assert_eq!(member.status(), Status::Busy);
        member.set_status(Status::Dead);
        assert_eq!(member.status().to_string(), "dead");
    }
}
