//! An action server's own live-instance registry.
//!
//! Every mutation republishes the server's complete `operation → instances`
//! map on a [`PubSub`] queue, in mutation order. Operations that once had an
//! instance stay in the map with an empty set so receivers see them drain.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::pubsub::{PubSub, Subscription};
use crate::status::{InstanceState, OperationStatus, StatusDelta, StatusMessage};

#[derive(Clone)]
pub struct ServerStatus {
    name: Arc<str>,
    table: Arc<Mutex<StatusDelta>>,
    queue: PubSub<StatusMessage>,
}

impl ServerStatus {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            table: Arc::new(Mutex::new(BTreeMap::new())),
            queue: PubSub::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, StatusDelta> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish while still holding the lock so messages leave in mutation order.
    fn publish_locked(&self, table: &StatusDelta) {
        self.queue.publish(StatusMessage {
            server: self.name.to_string(),
            status: table.clone(),
        });
    }

    pub fn register(&self, operation: &str, id: Uuid) {
        self.set(operation, id, InstanceState::Running);
    }

    pub fn set(&self, operation: &str, id: Uuid, state: InstanceState) {
        let mut table = self.lock();
        table.entry(operation.to_string()).or_default().insert(id, state);
        self.publish_locked(&table);
    }

    /// Forget `id`. Returns whether it was present.
    pub fn remove(&self, operation: &str, id: Uuid) -> bool {
        let mut table = self.lock();
        let removed = table
            .get_mut(operation)
            .is_some_and(|ids| ids.remove(&id).is_some());
        if removed {
            self.publish_locked(&table);
        }
        removed
    }

    /// Tag every running instance as estopped. Returns the tagged ids.
    pub fn estop_all(&self) -> Vec<Uuid> {
        let mut table = self.lock();
        let mut tagged = Vec::new();
        for ids in table.values_mut() {
            for (id, state) in ids.iter_mut() {
                if *state == InstanceState::Running {
                    *state = InstanceState::Estopped;
                    tagged.push(*id);
                }
            }
        }
        self.publish_locked(&table);
        tagged
    }

    /// Drop every instance in `state`. Returns how many were dropped.
    pub fn release(&self, state: InstanceState) -> usize {
        let mut table = self.lock();
        let mut n = 0;
        for ids in table.values_mut() {
            let before = ids.len();
            ids.retain(|_, s| *s != state);
            n += before - ids.len();
        }
        self.publish_locked(&table);
        n
    }

    pub fn state_of(&self, operation: &str, id: Uuid) -> Option<InstanceState> {
        self.lock().get(operation)?.get(&id).copied()
    }

    pub fn operation(&self, operation: &str) -> OperationStatus {
        self.lock().get(operation).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatusMessage {
        StatusMessage {
            server: self.name.to_string(),
            status: self.lock().clone(),
        }
    }

    /// Republish the current map, e.g. for a newly attached subscriber.
    pub fn publish_all(&self) {
        let table = self.lock();
        self.publish_locked(&table);
    }

    pub fn subscribe(&self) -> Subscription<StatusMessage> {
        self.queue.subscribe()
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

impl std::fmt::Debug for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStatus")
            .field("name", &self.name)
            .field("table", &*self.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn each_mutation_publishes_full_map() {
        let status = ServerStatus::new("pstat");
        let mut sub = status.subscribe();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        status.register("run_cv", a);
        status.register("run_ocv", b);
        assert!(status.remove("run_cv", a));
        assert!(!status.remove("run_cv", a));

        let first = sub.recv().await.unwrap();
        assert_eq!(first.server, "pstat");
        assert_eq!(first.status["run_cv"][&a], InstanceState::Running);
        let second = sub.recv().await.unwrap();
        assert_eq!(second.status.len(), 2);
        let third = sub.recv().await.unwrap();
        assert!(third.status["run_cv"].is_empty());
        assert_eq!(third.status["run_ocv"].len(), 1);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn estop_and_release() {
        let status = ServerStatus::new("motion");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        status.register("move", a);
        status.set("home", b, InstanceState::Errored);

        assert_eq!(status.estop_all(), vec![a]);
        assert_eq!(status.state_of("move", a), Some(InstanceState::Estopped));
        assert_eq!(status.state_of("home", b), Some(InstanceState::Errored));

        assert_eq!(status.release(InstanceState::Estopped), 1);
        assert!(status.operation("move").is_empty());
        assert_eq!(status.release(InstanceState::Errored), 1);
        assert!(status.snapshot().status.values().all(|ids| ids.is_empty()));
    }
}
