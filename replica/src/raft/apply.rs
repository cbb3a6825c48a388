use std::sync::Arc;

use super::{on_blocking_pool, Node};
use crate::error::Result;
use crate::metrics;
use crate::statemachine::StateMachineResponse;

impl Node {
    pub(crate) async fn apply_loop(self: Arc<Self>) {
        loop {
            self.commit_notify.notified().await;
            loop {
                match self.apply_committed().await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("{} failed to apply committed entries: {}", self.host, e);
                        break;
                    }
                }
            }
            if let Err(e) = self.maybe_compact().await {
                log::error!("{} compaction failed: {}", self.host, e);
            }
        }
    }

    /// Applies the next batch of committed entries and returns how many
    /// were applied. On the leader, responses go back to whoever submitted
    /// the request.
    pub(crate) async fn apply_committed(self: &Arc<Self>) -> Result<usize> {
        let (batch, leader) = {
            let core = self.core.lock().await;
            if core.last_applied >= core.commit_index {
                return Ok(0);
            }
            let start = core.last_applied + 1;
            let end = core
                .commit_index
                .min(core.last_applied + self.config.max_append_entries as u64);
            (core.wal.range(start, end)?, self.is_leader())
        };
        let last = match batch.last() {
            Some(entry) => entry.index,
            None => return Ok(0),
        };

        let count = batch.len();
        let state_machine = self.lock_state_machine().await;
        let applied =
            on_blocking_pool(state_machine, move |sm| sm.apply_entries(&batch)).await?;
        {
            let mut core = self.core.lock().await;
            if last > core.last_applied {
                core.last_applied = last;
                metrics::set_raft_gauge("last_applied", last);
            }
        }
        log::debug!(
            "{} applied {} entries through {}",
            self.host,
            count,
            last
        );

        if leader {
            for a in applied {
                self.deliver(a.response);
            }
        }
        Ok(count)
    }

    fn deliver(self: &Arc<Self>, response: StateMachineResponse) {
        if response.request_origin == self.host {
            self.complete_pending(response);
        } else {
            let node = self.clone();
            self.spawn(async move {
                let _ = node.forward_response(response).await;
            });
        }
    }
}
