//! Single-consumer owner of the orchestrator's [`StatusTable`].
//!
//! Pushed status messages and clear requests enter one [`PubSub`] queue. A
//! self-subscribed consumer task is the only code that mutates the table; after
//! every update it republishes the whole table as a [`TableSnapshot`] on a
//! `watch` channel, so readers always derive global state from one consistent
//! snapshot and waiters wake on every change.

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::table::{GlobalState, StatusMessage, StatusTable};
use crate::pubsub::{PubSub, Subscription};

#[derive(Debug, Clone)]
pub enum StatusUpdate {
    Delta(StatusMessage),
    Clear { estop: bool, error: bool },
}

/// The full table as of one applied update.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableSnapshot {
    pub revision: u64,
    pub global_state: GlobalState,
    pub table: StatusTable,
}

/// Raised when a delta introduces estopped ids.
#[derive(Debug, Clone)]
pub struct EstopSignal {
    pub server: String,
    pub ids: Vec<Uuid>,
}

pub struct StatusTracker {
    queue: PubSub<StatusUpdate>,
    snapshots: watch::Receiver<TableSnapshot>,
    task: JoinHandle<()>,
}

impl StatusTracker {
    /// Start the consumer task. New estops are reported on `estops` if given.
    pub fn spawn(estops: Option<mpsc::UnboundedSender<EstopSignal>>) -> Self {
        let queue = PubSub::new();
        let (tx, rx) = watch::channel(TableSnapshot::default());
        let sub = queue.subscribe();
        let task = tokio::spawn(consume(sub, tx, estops));
        Self {
            queue,
            snapshots: rx,
            task,
        }
    }

    /// Enqueue a pushed status message. Never blocks.
    pub fn push(&self, msg: StatusMessage) {
        self.queue.publish(StatusUpdate::Delta(msg));
    }

    /// Enqueue removal of estopped and/or errored ids.
    pub fn clear(&self, estop: bool, error: bool) {
        self.queue.publish(StatusUpdate::Clear { estop, error });
    }

    pub fn snapshot(&self) -> TableSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TableSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until the consumer has applied at least `revision` updates.
    pub async fn wait_for_revision(&self, revision: u64) -> TableSnapshot {
        let mut rx = self.snapshots.clone();
        let result = rx.wait_for(|s| s.revision >= revision).await;
        match result {
            Ok(snap) => snap.clone(),
            Err(_) => self.snapshot(),
        }
    }
}

impl Drop for StatusTracker {
    fn drop(&mut self) {
        self.queue.shutdown();
        self.task.abort();
    }
}

async fn consume(
    mut sub: Subscription<StatusUpdate>,
    tx: watch::Sender<TableSnapshot>,
    estops: Option<mpsc::UnboundedSender<EstopSignal>>,
) {
    let mut table = StatusTable::new();
    let mut revision = 0u64;

    while let Some(update) = sub.recv().await {
        let mut signal = None;
        match update {
            StatusUpdate::Delta(msg) => {
                let report = table.apply_delta(&msg.server, &msg.status);
                report.log();
                if !report.new_errors.is_empty() {
                    warn!(server = %msg.server, ids = ?report.new_errors, "action server reported errors");
                }
                if !report.new_estops.is_empty() {
                    warn!(server = %msg.server, ids = ?report.new_estops, "action server reported emergency stop");
                    signal = Some(EstopSignal {
                        server: msg.server,
                        ids: report.new_estops,
                    });
                }
            }
            StatusUpdate::Clear { estop, error } => {
                let removed = table.clear(estop, error);
                info!(estop, error, removed = removed.len(), "cleared tagged instances");
            }
        }

        revision += 1;
        tx.send_replace(TableSnapshot {
            revision,
            global_state: table.global_state(),
            table: table.clone(),
        });

        // Raised after publishing so the receiver already sees the new table.
        if let (Some(signal), Some(estops)) = (signal, &estops) {
            let _ = estops.send(signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::table::{InstanceState, StatusDelta};

    fn msg(server: &str, op: &str, ids: &[(Uuid, InstanceState)]) -> StatusMessage {
        let mut status = StatusDelta::new();
        status.insert(op.to_string(), ids.iter().copied().collect());
        StatusMessage {
            server: server.to_string(),
            status,
        }
    }

    #[tokio::test]
    async fn deltas_are_applied_in_order() {
        let tracker = StatusTracker::spawn(None);
        let a = Uuid::new_v4();
        tracker.push(msg("pstat", "run", &[(a, InstanceState::Running)]));
        tracker.push(msg("pstat", "run", &[]));
        let snap = tracker.wait_for_revision(2).await;
        assert!(snap.table.endpoint_idle("pstat", "run"));
        assert_eq!(snap.global_state, GlobalState::Idle);
    }

    #[tokio::test]
    async fn new_estop_raises_signal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = StatusTracker::spawn(Some(tx));
        let a = Uuid::new_v4();
        tracker.push(msg("pstat", "run", &[(a, InstanceState::Estopped)]));
        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.server, "pstat");
        assert_eq!(signal.ids, vec![a]);
    }

    #[tokio::test]
    async fn clear_is_republished() {
        let tracker = StatusTracker::spawn(None);
        let a = Uuid::new_v4();
        tracker.push(msg("pstat", "run", &[(a, InstanceState::Errored)]));
        tracker.clear(false, true);
        let snap = tracker.wait_for_revision(2).await;
        assert!(snap.table.operation("pstat", "run").unwrap().is_empty());
        assert!(snap.table.classify().errored.is_empty());
    }

    #[tokio::test]
    async fn watchers_wake_on_change() {
        let tracker = StatusTracker::spawn(None);
        let mut rx = tracker.watch();
        let _ = rx.borrow_and_update();
        tracker.push(msg("motion", "move", &[(Uuid::new_v4(), InstanceState::Running)]));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().global_state, GlobalState::Busy);
    }
}
