use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Instant;

use super::Node;
use crate::member::Status;
use crate::metrics;
use crate::rpc::{VoteRequest, VoteResponse};

impl Node {
    pub(crate) async fn election_timer(self: Arc<Self>) {
        loop {
            let deadline = {
                let core = self.core.lock().await;
                if self.is_leader() {
                    None
                } else {
                    Some(core.election_deadline)
                }
            };
            match deadline {
                None => tokio::time::sleep(self.config.heartbeat_interval()).await,
                Some(deadline) if Instant::now() < deadline => {
                    tokio::time::sleep_until(deadline).await
                }
                Some(_) => self.start_election().await,
            }
        }
    }

    /// Becomes a candidate for the next term and asks every peer for a vote.
    pub(crate) async fn start_election(self: &Arc<Self>) {
        let request = {
            let mut core = self.core.lock().await;
            if self.is_leader() {
                return;
            }
            let term = self.local.current_term() + 1;
            self.reset_election_timer(&mut core);
            if let Err(e) = core.wal.save_hard_state(term, Some(self.host.clone())) {
                log::error!("{} failed to persist vote for term {}: {}", self.host, term, e);
                return;
            }
            self.local.set_term(term, Some(self.host.clone()));
            self.set_local_status(Status::Candidate);
            core.leader_id = None;
            metrics::set_raft_gauge("term", term);
            VoteRequest {
                term,
                candidate_id: self.host.clone(),
                last_log_index: core.wal.latest_index(),
                last_log_term: core.wal.latest_term(),
            }
        };
        let term = request.term;
        log::info!("{} starting election for term {}", self.host, term);

        let quorum = self.membership.quorum();
        let mut votes = 1;
        if votes >= quorum {
            self.become_leader(term).await;
            return;
        }

        let mut requests = JoinSet::new();
        for peer in self.membership.peers() {
            let transport = self.transport.clone();
            let host = peer.host.clone();
            let req = request.clone();
            let timeout = self.config.rpc_timeout();
            requests.spawn(async move {
                let result = tokio::time::timeout(timeout, transport.request_vote(&host, req)).await;
                (host, result)
            });
        }

        while let Some(joined) = requests.join_next().await {
            let (host, result) = match joined {
                Ok(r) => r,
                Err(_) => continue,
            };
            match result {
                Ok(Ok(resp)) => {
                    if resp.term > term {
                        self.step_down(resp.term).await;
                        return;
                    }
                    if resp.vote_granted {
                        votes += 1;
                        log::debug!("{} got vote from {} for term {}", self.host, host, term);
                        if votes >= quorum {
                            self.become_leader(term).await;
                            return;
                        }
                    }
                }
                Ok(Err(e)) => log::debug!("vote request to {} failed: {}", host, e),
                Err(_) => log::debug!("vote request to {} timed out", host),
            }
        }
        log::debug!(
            "{} did not win term {} with {} of {} votes",
            self.host,
            term,
            votes,
            quorum
        );
    }

    /// Takes over as leader of `term` if still a candidate for it.
    pub(crate) async fn become_leader(self: &Arc<Self>, term: u64) {
        {
            let mut core = self.core.lock().await;
            if self.local.current_term() != term || self.local.status() != Status::Candidate {
                return;
            }
            self.set_local_status(Status::Leader);
            core.leader_id = Some(self.host.clone());
            let next = core.wal.latest_index() + 1;
            for peer in self.membership.peers() {
                peer.reset_progress(next);
            }
            // entries of earlier terms only commit behind one of our own
            if let Err(e) = core.wal.append_command(term, String::new()) {
                log::error!("{} failed to append no-op for term {}: {}", self.host, term, e);
            }
            self.advance_commit(&mut core, term);
            log::info!("{} became leader for term {}", self.host, term);
        }

        for peer in self.membership.peers() {
            let node = self.clone();
            let peer = peer.clone();
            self.spawn(async move { node.replication_worker(peer, term).await });
        }
    }

    pub async fn handle_request_vote(&self, req: VoteRequest) -> VoteResponse {
        let mut core = self.core.lock().await;
        if let Err(e) = self.observe_term(&mut core, req.term) {
            log::error!("{} failed to persist term {}: {}", self.host, req.term, e);
        }
        let current = self.local.current_term();
        let reject = VoteResponse {
            term: current,
            vote_granted: false,
        };
        if req.term < current {
            return reject;
        }

        let can_vote = self
            .local
            .voted_for()
            .map_or(true, |v| v == req.candidate_id);
        let up_to_date = (req.last_log_term, req.last_log_index)
            >= (core.wal.latest_term(), core.wal.latest_index());
        if !can_vote || !up_to_date {
            log::debug!(
                "{} refused vote to {} for term {} (can vote: {}, up to date: {})",
                self.host,
                req.candidate_id,
                current,
                can_vote,
                up_to_date
            );
            return reject;
        }

        if let Err(e) = core
            .wal
            .save_hard_state(current, Some(req.candidate_id.clone()))
        {
            log::error!("{} failed to persist vote: {}", self.host, e);
            return reject;
        }
        self.local.set_term(current, Some(req.candidate_id.clone()));
        self.reset_election_timer(&mut core);
        log::debug!("{} voted for {} in term {}", self.host, req.candidate_id, current);
        VoteResponse {
            term: current,
            vote_granted: true,
        }
    }
}
