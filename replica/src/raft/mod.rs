//! Consensus engine
//!
//! A [`Node`] owns the local write-ahead log and state machine, and runs the
//! background workers that keep them in agreement with the rest of the
//! cluster: the election timer, per-follower replication workers, the apply
//! loop, and the relay and command queues that carry client operations to
//! the leader.
//!
//! Term, vote and role of the local node live in its own [`Member`] record
//! and only change while the core lock is held. When both the core and the
//! state machine have to be locked, the core is always taken first.
//!
//! Installing a snapshot from the leader holds the core lock for the whole
//! file swap, so the apply loop, elections and replication wait until the
//! new state machine image is in place.

mod apply;
mod election;
mod relay;
mod replication;
mod snapshot;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, oneshot, Mutex, Notify, OwnedMutexGuard};
use tokio::task::{self, JoinHandle};
use tokio::time::Instant;

use crate::config::{NodeConfig, RaftConfig};
use crate::error::{Error, Result};
use crate::member::{Member, Membership, Status};
use crate::metrics;
use crate::rpc::Transport;
use crate::statemachine::{StateMachine, StateMachineOperation, StateMachineResponse};
use crate::util::ExponentialBackoff;
use crate::wal::Wal;

pub use replication::Progress;

const WAL_DIR: &str = "wal";

/// A snapshot file on disk together with the log position it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub path: PathBuf,
    pub last_included_index: u64,
    pub last_included_term: u64,
}

pub(crate) struct Core {
    pub(crate) wal: Wal,
    pub(crate) leader_id: Option<String>,
    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,
    pub(crate) election_deadline: Instant,
}

struct Receivers {
    relay: mpsc::Receiver<StateMachineOperation>,
    failed: mpsc::Receiver<StateMachineOperation>,
    command: mpsc::Receiver<StateMachineOperation>,
}

pub struct Node {
    host: String,
    config: RaftConfig,
    membership: Membership,
    local: Arc<Member>,
    transport: Arc<dyn Transport>,
    core: Mutex<Core>,
    state_machine: Arc<Mutex<StateMachine>>,
    latest_snapshot: StdMutex<Option<SnapshotMeta>>,
    /// Callers on this node waiting for the response to their request id
    pending: StdMutex<HashMap<String, oneshot::Sender<StateMachineResponse>>>,
    relay_tx: mpsc::Sender<StateMachineOperation>,
    failed_tx: mpsc::Sender<StateMachineOperation>,
    command_tx: mpsc::Sender<StateMachineOperation>,
    receivers: StdMutex<Option<Receivers>>,
    commit_notify: Notify,
    replicate_notify: Notify,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Opens the log and state machine under `data_dir` and restores the
    /// persisted term and vote. No background work starts until
    /// [`start`](Self::start).
    pub fn open(
        host: impl Into<String>,
        nodes: &[NodeConfig],
        data_dir: impl AsRef<Path>,
        config: RaftConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Node>> {
        let host = host.into();
        let data_dir = data_dir.as_ref();
        let membership = Membership::new(host.clone(), nodes);
        let local = membership
            .local()
            .cloned()
            .ok_or_else(|| Error::UnknownMember(host.clone()))?;

        let wal = Wal::open(data_dir.join(WAL_DIR))?;
        let state_machine = StateMachine::open(data_dir, &config.db_file)?;
        local.set_term(wal.meta().current_term, wal.meta().voted_for.clone());
        local.set_status(Status::Follower);

        let last_applied = state_machine.last_applied();
        log::info!(
            "{} opened at term {}, wal {}..={}, last applied {}",
            host,
            local.current_term(),
            wal.earliest_index(),
            wal.latest_index(),
            last_applied
        );

        let (relay_tx, relay) = mpsc::channel(config.relay_queue_size.max(1));
        let (failed_tx, failed) = mpsc::channel(config.failed_queue_size.max(1));
        let (command_tx, command) = mpsc::channel(config.command_queue_size.max(1));
        let election_deadline = Instant::now() + config.random_election_timeout();

        Ok(Arc::new(Node {
            host,
            config,
            membership,
            local,
            transport,
            core: Mutex::new(Core {
                wal,
                leader_id: None,
                commit_index: last_applied,
                last_applied,
                election_deadline,
            }),
            state_machine: Arc::new(Mutex::new(state_machine)),
            latest_snapshot: StdMutex::new(None),
            pending: StdMutex::new(HashMap::new()),
            relay_tx,
            failed_tx,
            command_tx,
            receivers: StdMutex::new(Some(Receivers {
                relay,
                failed,
                command,
            })),
            commit_notify: Notify::new(),
            replicate_notify: Notify::new(),
            tasks: StdMutex::new(Vec::new()),
        }))
    }

    /// Spawns the background workers. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let receivers = match self.receivers.lock().unwrap().take() {
            Some(r) => r,
            None => return,
        };
        self.spawn(self.clone().election_timer());
        self.spawn(self.clone().apply_loop());
        self.spawn(self.clone().relay_loop(receivers.relay));
        self.spawn(self.clone().failed_relay_loop(receivers.failed));
        self.spawn(self.clone().command_loop(receivers.command));
        // entries committed before a restart are applied without waiting
        self.commit_notify.notify_one();
        log::info!("{} started with {} members", self.host, self.membership.len());
    }

    /// Aborts every background task. Callers still waiting on a response
    /// get [`Error::Shutdown`].
    pub fn stop(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.pending.lock().unwrap().clear();
        log::info!("{} stopped", self.host);
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn status(&self) -> Status {
        self.local.status()
    }

    pub fn current_term(&self) -> u64 {
        self.local.current_term()
    }

    pub fn is_leader(&self) -> bool {
        self.local.status() == Status::Leader
    }

    pub async fn leader_id(&self) -> Option<String> {
        self.core.lock().await.leader_id.clone()
    }

    pub async fn commit_index(&self) -> u64 {
        self.core.lock().await.commit_index
    }

    pub async fn last_applied(&self) -> u64 {
        self.core.lock().await.last_applied
    }

    /// Earliest and latest index held by the local log.
    pub async fn wal_bounds(&self) -> (u64, u64) {
        let core = self.core.lock().await;
        (core.wal.earliest_index(), core.wal.latest_index())
    }

    /// Reads a key from the local state machine without going through the
    /// log.
    pub async fn read_local(&self, key: &str) -> Option<String> {
        self.state_machine.lock().await.store().get(key).cloned()
    }

    pub fn latest_snapshot(&self) -> Option<SnapshotMeta> {
        self.latest_snapshot.lock().unwrap().clone()
    }

    async fn lock_state_machine(&self) -> OwnedMutexGuard<StateMachine> {
        self.state_machine.clone().lock_owned().await
    }

    fn is_leader_in(&self, term: u64) -> bool {
        self.local.status() == Status::Leader && self.local.current_term() == term
    }

    fn set_local_status(&self, status: Status) {
        if self.local.status() != status {
            self.local.set_status(status);
            metrics::inc_member_status(&status.to_string());
        }
    }

    fn reset_election_timer(&self, core: &mut Core) {
        core.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    /// Adopts a higher term seen in any message and falls back to follower.
    /// Returns whether the term changed.
    fn observe_term(&self, core: &mut Core, term: u64) -> Result<bool> {
        if term <= self.local.current_term() {
            return Ok(false);
        }
        core.wal.save_hard_state(term, None)?;
        self.local.set_term(term, None);
        if self.local.status() != Status::Follower {
            log::info!("{} stepping down to follower in term {}", self.host, term);
            // a leader's deadline went stale while it was not watching it
            self.reset_election_timer(core);
        }
        self.set_local_status(Status::Follower);
        core.leader_id = None;
        metrics::set_raft_gauge("term", term);
        Ok(true)
    }

    async fn step_down(&self, term: u64) {
        let mut core = self.core.lock().await;
        if let Err(e) = self.observe_term(&mut core, term) {
            log::error!("{} failed to persist term {}: {}", self.host, term, e);
        }
    }

    /// Records an exhausted peer as dead and drops its pooled connections.
    fn mark_dead(&self, host: &str) {
        if let Some(member) = self.membership.get(host) {
            if member.status() != Status::Dead {
                log::warn!("system {} unreachable, setting status to dead", host);
                member.set_status(Status::Dead);
                metrics::inc_member_status(&Status::Dead.to_string());
            }
        }
        self.transport.close_connections(host);
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            self.config.forward_max_retries,
            self.config.forward_base_delay(),
        )
        .with_max_delay(self.config.rpc_timeout())
    }
}

/// Runs file work on the state machine on the blocking pool. The lock is
/// held until `f` returns.
async fn on_blocking_pool<T, F>(
    mut state_machine: OwnedMutexGuard<StateMachine>,
    f: F,
) -> Result<T>
where
    F: FnOnce(&mut StateMachine) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(move || f(&mut *state_machine)).await?
}
