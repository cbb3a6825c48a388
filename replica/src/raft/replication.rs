use std::sync::Arc;

use super::{Core, Node};
use crate::error::Result;
use crate::member::{Member, Status};
use crate::metrics;
use crate::rpc::{AppendEntryRequest, AppendEntryResponse};

/// Outcome of one replication round towards a follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The follower holds everything the leader has.
    UpToDate,
    /// More entries are waiting, or the log position is still being found.
    Behind,
    /// The follower did not answer.
    Unreachable,
    /// This node is no longer leader of the worker's term.
    Stopped,
}

// Dead peers stay dead until they answer again.
pub(crate) fn mark_busy(peer: &Member) {
    if peer.status() != Status::Dead {
        peer.set_status(Status::Busy);
    }
}

pub(crate) fn mark_idle(peer: &Member) {
    if peer.status() == Status::Busy {
        peer.set_status(Status::Ready);
    }
}

impl Node {
    /// Keeps one follower in sync for as long as this node leads `term`.
    pub(crate) async fn replication_worker(self: Arc<Self>, peer: Arc<Member>, term: u64) {
        let mut failures = 0;
        loop {
            match self.replicate_to(&peer, term).await {
                Progress::Stopped => break,
                Progress::Behind => {
                    failures = 0;
                    continue;
                }
                Progress::UpToDate => failures = 0,
                Progress::Unreachable => {
                    failures += 1;
                    if failures == self.config.forward_max_retries {
                        self.mark_dead(&peer.host);
                    }
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval()) => {}
                _ = self.replicate_notify.notified() => {}
            }
        }
        log::debug!(
            "{} stopped replicating to {} for term {}",
            self.host,
            peer.host,
            term
        );
    }

    /// Sends the follower whatever it is missing, or a heartbeat when it
    /// has everything. Falls back to a snapshot once the follower needs
    /// entries that were compacted away.
    pub(crate) async fn replicate_to(&self, peer: &Member, term: u64) -> Progress {
        let request = {
            let core = self.core.lock().await;
            if !self.is_leader_in(term) {
                return Progress::Stopped;
            }
            let next = peer.next_index();
            if next < core.wal.earliest_index() {
                None
            } else {
                let prev_log_index = next - 1;
                match (
                    core.wal.term_at(prev_log_index),
                    core.wal.entries_from(next, self.config.max_append_entries),
                ) {
                    (Some(prev_log_term), Ok(entries)) => Some(AppendEntryRequest {
                        term,
                        leader_id: self.host.clone(),
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit_index: core.commit_index,
                    }),
                    _ => None,
                }
            }
        };
        let request = match request {
            Some(r) => r,
            None => return self.send_snapshot(peer, term).await,
        };

        let prev_log_index = request.prev_log_index;
        let last_sent = prev_log_index + request.entries.len() as u64;
        mark_busy(peer);
        let result = tokio::time::timeout(
            self.config.rpc_timeout(),
            self.transport.append_entry(&peer.host, request),
        )
        .await;
        let response = match result {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                log::debug!("append to {} failed: {}", peer.host, e);
                mark_idle(peer);
                return Progress::Unreachable;
            }
            Err(_) => {
                log::debug!("append to {} timed out", peer.host);
                mark_idle(peer);
                return Progress::Unreachable;
            }
        };
        if response.term > term {
            self.step_down(response.term).await;
            return Progress::Stopped;
        }
        peer.set_status(Status::Ready);

        let mut core = self.core.lock().await;
        if !self.is_leader_in(term) {
            return Progress::Stopped;
        }
        if response.success {
            peer.record_match(last_sent);
            self.advance_commit(&mut core, term);
            if peer.next_index() <= core.wal.latest_index() {
                Progress::Behind
            } else {
                Progress::UpToDate
            }
        } else {
            let next = peer.decrement_next();
            log::debug!(
                "{} rejected entries after {}, retrying from {}",
                peer.host,
                prev_log_index,
                next
            );
            Progress::Behind
        }
    }

    /// Moves the commit index to the highest index stored on a majority,
    /// provided that entry belongs to the current term.
    pub(crate) fn advance_commit(&self, core: &mut Core, term: u64) {
        if !self.is_leader_in(term) {
            return;
        }
        let mut matched: Vec<u64> = self.membership.peers().map(|p| p.match_index()).collect();
        matched.push(core.wal.latest_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[self.membership.quorum() - 1];
        if candidate > core.commit_index && core.wal.term_at(candidate) == Some(term) {
            core.commit_index = candidate;
            metrics::set_raft_gauge("commit_index", candidate);
            self.commit_notify.notify_one();
        }
    }

    pub async fn handle_append_entry(&self, req: AppendEntryRequest) -> AppendEntryResponse {
        let mut core = self.core.lock().await;
        let success = match self.accept_entries(&mut core, req) {
            Ok(success) => success,
            Err(e) => {
                log::error!("{} failed to append entries: {}", self.host, e);
                false
            }
        };
        AppendEntryResponse {
            term: self.local.current_term(),
            success,
        }
    }

    fn accept_entries(&self, core: &mut Core, req: AppendEntryRequest) -> Result<bool> {
        self.observe_term(core, req.term)?;
        if req.term < self.local.current_term() {
            return Ok(false);
        }
        self.set_local_status(Status::Follower);
        core.leader_id = Some(req.leader_id.clone());
        self.reset_election_timer(core);

        let prev = req.prev_log_index;
        if prev > core.wal.latest_index() {
            return Ok(false);
        }
        if prev >= core.wal.snapshot_index() && core.wal.term_at(prev) != Some(req.prev_log_term) {
            return Ok(false);
        }

        let last_new = prev + req.entries.len() as u64;
        let mut fresh = Vec::new();
        for entry in req.entries {
            if !fresh.is_empty() {
                fresh.push(entry);
                continue;
            }
            if entry.index <= core.wal.snapshot_index() {
                continue;
            }
            match core.wal.term_at(entry.index) {
                Some(t) if t == entry.term => {}
                Some(_) => {
                    if entry.index <= core.commit_index {
                        log::error!(
                            "{} refusing to overwrite committed entry {}",
                            self.host,
                            entry.index
                        );
                        return Ok(false);
                    }
                    log::debug!("{} truncating log from {}", self.host, entry.index);
                    core.wal.truncate_from(entry.index)?;
                    fresh.push(entry);
                }
                None => fresh.push(entry),
            }
        }
        if !fresh.is_empty() {
            core.wal.append(fresh)?;
            metrics::set_raft_gauge("wal_latest", core.wal.latest_index());
        }

        let commit = req.leader_commit_index.min(last_new);
        if commit > core.commit_index {
            core.commit_index = commit;
            metrics::set_raft_gauge("commit_index", commit);
            self.commit_notify.notify_one();
        }
        Ok(true)
    }
}
