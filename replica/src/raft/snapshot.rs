use super::replication::{mark_busy, mark_idle, Progress};
use super::{on_blocking_pool, Core, Node, SnapshotMeta};
use crate::error::{Error, Result};
use crate::member::{Member, Status};
use crate::metrics;
use crate::rpc::{InstallSnapshotRequest, InstallSnapshotResponse};

impl Node {
    /// Snapshots the state machine at its last applied index.
    pub async fn take_snapshot(&self) -> Result<SnapshotMeta> {
        let core = self.core.lock().await;
        let state_machine = self.lock_state_machine().await;
        let index = state_machine.last_applied();
        let term = core.wal.term_at(index).ok_or(Error::Compacted(index))?;
        drop(core);

        let path = on_blocking_pool(state_machine, |sm| {
            let path = sm.snapshot()?;
            sm.prune_snapshots(&path)?;
            Ok(path)
        })
        .await?;
        let meta = SnapshotMeta {
            path,
            last_included_index: index,
            last_included_term: term,
        };
        log::info!(
            "{} took snapshot at index {} term {}",
            self.host,
            index,
            term
        );
        *self.latest_snapshot.lock().unwrap() = Some(meta.clone());
        Ok(meta)
    }

    /// Snapshots and compacts the log once enough entries were applied
    /// since the last compaction. The newest `wal_retain` applied entries
    /// stay in the log for followers that are only slightly behind.
    pub(crate) async fn maybe_compact(&self) -> Result<()> {
        let (applied, boundary) = {
            let core = self.core.lock().await;
            (core.last_applied, core.wal.snapshot_index())
        };
        if applied.saturating_sub(boundary) <= self.config.snapshot_threshold {
            return Ok(());
        }

        let meta = self.take_snapshot().await?;
        let cut = meta
            .last_included_index
            .saturating_sub(self.config.wal_retain);
        let mut core = self.core.lock().await;
        if cut > core.wal.snapshot_index() {
            core.wal.compact_until(cut)?;
            log::info!("{} compacted log through index {}", self.host, cut);
        }
        Ok(())
    }

    /// Latest snapshot if it still covers everything compacted out of the
    /// log, otherwise a fresh one.
    async fn snapshot_for_transfer(&self) -> Result<SnapshotMeta> {
        let boundary = self.core.lock().await.wal.snapshot_index();
        let latest = self.latest_snapshot.lock().unwrap().clone();
        if let Some(meta) = latest {
            if meta.last_included_index >= boundary && meta.path.exists() {
                return Ok(meta);
            }
        }
        self.take_snapshot().await
    }

    /// Ships the state machine to a follower whose next index fell below
    /// the earliest entry still in the log.
    pub(crate) async fn send_snapshot(&self, peer: &Member, term: u64) -> Progress {
        let meta = match self.snapshot_for_transfer().await {
            Ok(m) => m,
            Err(e) => {
                log::error!("{} could not prepare snapshot: {}", self.host, e);
                return Progress::Unreachable;
            }
        };
        let data = match tokio::fs::read(&meta.path).await {
            Ok(d) => d,
            Err(e) => {
                log::error!("failed to read snapshot {:?}: {}", meta.path, e);
                return Progress::Unreachable;
            }
        };
        log::info!(
            "{} sending snapshot at index {} ({} bytes) to {}",
            self.host,
            meta.last_included_index,
            data.len(),
            peer.host
        );

        let request = InstallSnapshotRequest {
            term,
            leader_id: self.host.clone(),
            last_included_index: meta.last_included_index,
            last_included_term: meta.last_included_term,
            data,
        };
        mark_busy(peer);
        let result = tokio::time::timeout(
            self.config.snapshot_timeout(),
            self.transport.install_snapshot(&peer.host, request),
        )
        .await;
        let response = match result {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                log::warn!("snapshot to {} failed: {}", peer.host, e);
                mark_idle(peer);
                return Progress::Unreachable;
            }
            Err(_) => {
                log::warn!("snapshot to {} timed out", peer.host);
                mark_idle(peer);
                return Progress::Unreachable;
            }
        };
        if response.term > term {
            self.step_down(response.term).await;
            return Progress::Stopped;
        }
        peer.set_status(Status::Ready);
        if !response.success {
            return Progress::UpToDate;
        }

        let mut core = self.core.lock().await;
        if !self.is_leader_in(term) {
            return Progress::Stopped;
        }
        peer.record_match(meta.last_included_index);
        self.advance_commit(&mut core, term);
        if peer.next_index() <= core.wal.latest_index() {
            Progress::Behind
        } else {
            Progress::UpToDate
        }
    }

    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        let mut core = self.core.lock().await;
        if let Err(e) = self.observe_term(&mut core, req.term) {
            log::error!("{} failed to persist term {}: {}", self.host, req.term, e);
        }
        let current = self.local.current_term();
        if req.term < current {
            return InstallSnapshotResponse {
                term: current,
                success: false,
            };
        }
        self.set_local_status(Status::Follower);
        core.leader_id = Some(req.leader_id.clone());
        self.reset_election_timer(&mut core);

        if req.last_included_index <= core.last_applied {
            log::debug!(
                "{} already applied through {}, ignoring snapshot at {}",
                self.host,
                core.last_applied,
                req.last_included_index
            );
            return InstallSnapshotResponse {
                term: current,
                success: true,
            };
        }

        log::info!(
            "{} entering maintenance to install snapshot at {}",
            self.host,
            req.last_included_index
        );
        metrics::set_raft_gauge("maintenance", 1);
        let result = self.install_snapshot(&mut core, req).await;
        metrics::set_raft_gauge("maintenance", 0);
        self.reset_election_timer(&mut core);
        let success = match result {
            Ok(()) => {
                self.commit_notify.notify_one();
                true
            }
            Err(e) => {
                log::error!("{} failed to install snapshot: {}", self.host, e);
                false
            }
        };
        InstallSnapshotResponse {
            term: current,
            success,
        }
    }

    async fn install_snapshot(&self, core: &mut Core, req: InstallSnapshotRequest) -> Result<()> {
        let InstallSnapshotRequest {
            leader_id,
            last_included_index: index,
            last_included_term: term,
            data,
            ..
        } = req;
        let state_machine = self.lock_state_machine().await;
        let (path, applied) = on_blocking_pool(state_machine, move |sm| {
            let path = sm.save_received_snapshot(&data)?;
            sm.replay(&path)?;
            sm.prune_snapshots(&path)?;
            Ok((path, sm.last_applied()))
        })
        .await?;

        if core.wal.term_at(index) == Some(term) {
            core.wal.compact_until(index)?;
        } else {
            core.wal.reset_to(index, term)?;
        }
        core.commit_index = core.commit_index.max(index);
        core.last_applied = applied.max(core.last_applied);
        *self.latest_snapshot.lock().unwrap() = Some(SnapshotMeta {
            path,
            last_included_index: index,
            last_included_term: term,
        });
        log::info!(
            "{} installed snapshot at index {} term {} from {}",
            self.host,
            index,
            term,
            leader_id
        );
        Ok(())
    }
}
