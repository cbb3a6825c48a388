//! Client operations on their way to the leader, and responses on their
//! way back to the node that accepted the request.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::Node;
use crate::error::{Error, Result};
use crate::statemachine::{Command, StateMachineOperation, StateMachineResponse};

impl Node {
    /// Submits a command through this node and waits for the leader's
    /// response.
    pub async fn submit(&self, command: Command) -> Result<StateMachineResponse> {
        self.submit_operation(StateMachineOperation::new(self.host.clone(), command))
            .await
    }

    /// Like [`submit`](Self::submit) for a prepared operation. The request
    /// id is kept, so resubmitting an operation never applies it twice.
    pub async fn submit_operation(
        &self,
        mut op: StateMachineOperation,
    ) -> Result<StateMachineResponse> {
        op.request_origin = self.host.clone();
        let request_id = op.request_id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(request_id.clone(), tx);

        let queued = if self.is_leader() {
            self.command_tx
                .try_send(op)
                .map_err(|_| Error::QueueFull("command"))
        } else {
            self.relay_tx
                .try_send(op)
                .map_err(|_| Error::QueueFull("relay"))
        };
        if let Err(e) = queued {
            self.pending.lock().unwrap().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.client_timeout(), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => {
                self.pending.lock().unwrap().remove(&request_id);
                Err(Error::Timeout(format!("request {}", request_id)))
            }
        }
    }

    fn is_pending(&self, request_id: &str) -> bool {
        self.pending.lock().unwrap().contains_key(request_id)
    }

    /// Wakes the caller waiting on this response. Returns false when no
    /// one is waiting anymore.
    pub(crate) fn complete_pending(&self, response: StateMachineResponse) -> bool {
        let waiter = self.pending.lock().unwrap().remove(&response.request_id);
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    fn park_failed(&self, op: StateMachineOperation) {
        if let Err(e) = self.failed_tx.try_send(op) {
            log::error!(
                "failed relay queue is full, dropping request {}",
                e.into_inner().request_id
            );
        }
    }

    fn requeue_relay(&self, op: StateMachineOperation) {
        if let Err(e) = self.relay_tx.try_send(op) {
            self.park_failed(e.into_inner());
        }
    }

    pub(crate) async fn relay_loop(self: Arc<Self>, mut relay: mpsc::Receiver<StateMachineOperation>) {
        while let Some(op) = relay.recv().await {
            self.relay_operation(op).await;
        }
    }

    async fn relay_operation(&self, op: StateMachineOperation) {
        if self.is_leader() {
            if let Err(e) = self.command_tx.try_send(op) {
                self.park_failed(e.into_inner());
            }
            return;
        }
        let leader = self.core.lock().await.leader_id.clone();
        let leader = match leader {
            Some(leader) if leader != self.host => leader,
            _ => {
                log::debug!("no leader known, parking request {}", op.request_id);
                self.park_failed(op);
                return;
            }
        };
        let encoded = match op.encode() {
            Ok(e) => e,
            Err(e) => {
                log::error!("failed to encode request {}: {}", op.request_id, e);
                return;
            }
        };

        let transport = self.transport.clone();
        let host = self.host.clone();
        let timeout = self.config.rpc_timeout();
        let result = self
            .backoff()
            .perform(|| {
                let transport = transport.clone();
                let host = host.clone();
                let leader = leader.clone();
                let encoded = encoded.clone();
                async move {
                    match tokio::time::timeout(timeout, transport.relay(&leader, &host, encoded))
                        .await
                    {
                        Ok(Ok(true)) => Ok(()),
                        Ok(Ok(false)) => Err(Error::NotLeader(Some(leader))),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(Error::Timeout(leader)),
                    }
                }
            })
            .await;

        match result {
            Ok(()) => log::debug!("relayed request {} to {}", op.request_id, leader),
            Err(Error::NotLeader(_)) => {
                log::debug!("{} refused request {}", leader, op.request_id);
                self.park_failed(op);
            }
            Err(e) => {
                log::warn!("relay of {} to {} failed: {}", op.request_id, leader, e);
                self.mark_dead(&leader);
                self.park_failed(op);
            }
        }
    }

    /// Feeds parked operations back into the relay queue once per
    /// heartbeat. Operations whose local caller gave up are dropped.
    pub(crate) async fn failed_relay_loop(
        self: Arc<Self>,
        mut failed: mpsc::Receiver<StateMachineOperation>,
    ) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            ticker.tick().await;
            let mut parked = Vec::new();
            while let Ok(op) = failed.try_recv() {
                parked.push(op);
            }
            for op in parked {
                if op.request_origin == self.host && !self.is_pending(&op.request_id) {
                    log::debug!("dropping abandoned request {}", op.request_id);
                    continue;
                }
                self.requeue_relay(op);
            }
        }
    }

    pub(crate) async fn command_loop(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<StateMachineOperation>,
    ) {
        while let Some(op) = commands.recv().await {
            let mut batch = vec![op];
            while batch.len() < self.config.max_append_entries {
                match commands.try_recv() {
                    Ok(op) => batch.push(op),
                    Err(_) => break,
                }
            }
            self.append_operations(batch).await;
        }
    }

    /// Appends operations to the leader's log under the current term.
    /// After losing leadership they go back through the relay queue.
    async fn append_operations(&self, ops: Vec<StateMachineOperation>) {
        let mut core = self.core.lock().await;
        let term = self.local.current_term();
        if !self.is_leader_in(term) {
            drop(core);
            for op in ops {
                self.requeue_relay(op);
            }
            return;
        }
        for op in ops {
            let command = match op.encode() {
                Ok(c) => c,
                Err(e) => {
                    log::error!("failed to encode request {}: {}", op.request_id, e);
                    continue;
                }
            };
            if let Err(e) = core.wal.append_command(term, command) {
                log::error!("failed to append request {}: {}", op.request_id, e);
            }
        }
        crate::metrics::set_raft_gauge("wal_latest", core.wal.latest_index());
        self.advance_commit(&mut core, term);
        drop(core);
        self.replicate_notify.notify_waiters();
    }

    /// Accepts an operation relayed by a follower. Only the leader accepts.
    pub fn handle_relay(&self, from: &str, operation: &str) -> bool {
        let op = match StateMachineOperation::decode(operation) {
            Ok(op) => op,
            Err(e) => {
                log::warn!("undecodable operation relayed by {}: {}", from, e);
                return false;
            }
        };
        if !self.is_leader() {
            return false;
        }
        log::debug!("accepted request {} relayed by {}", op.request_id, from);
        match self.command_tx.try_send(op) {
            Ok(()) => true,
            Err(_) => {
                log::warn!("command queue is full, refusing relay from {}", from);
                false
            }
        }
    }

    /// Sends an applied response back to the node that accepted the
    /// request. Once the retries are exhausted the origin is marked dead.
    pub(crate) async fn forward_response(&self, response: StateMachineResponse) -> Result<()> {
        let origin = response.request_origin.clone();
        let encoded = response.encode()?;
        let transport = self.transport.clone();
        let host = self.host.clone();
        let timeout = self.config.rpc_timeout();
        let result = self
            .backoff()
            .perform(|| {
                let transport = transport.clone();
                let host = host.clone();
                let origin = origin.clone();
                let encoded = encoded.clone();
                async move {
                    match tokio::time::timeout(
                        timeout,
                        transport.forward_resp(&origin, &host, encoded),
                    )
                    .await
                    {
                        Ok(Ok(true)) => Ok(()),
                        Ok(Ok(false)) => Err(Error::Transport(format!(
                            "{} did not process the response",
                            origin
                        ))),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(Error::Timeout(origin)),
                    }
                }
            })
            .await;

        if let Err(e) = result {
            log::warn!(
                "forwarding response {} to {} failed: {}",
                response.request_id,
                origin,
                e
            );
            self.mark_dead(&origin);
            return Err(e);
        }
        Ok(())
    }

    /// Delivers a response forwarded by the leader to the local caller.
    pub fn handle_forward_resp(&self, from: &str, response: &str) -> bool {
        let response = match StateMachineResponse::decode(response) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("undecodable response forwarded by {}: {}", from, e);
                return false;
            }
        };
        if response.request_origin != self.host {
            log::warn!(
                "{} forwarded response {} meant for {}",
                from,
                response.request_id,
                response.request_origin
            );
            return false;
        }
        if !self.complete_pending(response) {
            log::debug!("response forwarded by {} has no waiting caller", from);
        }
        true
    }
}
