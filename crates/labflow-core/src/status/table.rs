//! The orchestrator's belief about which action instances are live where.
//!
//! Layout: `server → operation → {instance id → state}`. Keying instances by
//! id within an operation means an id is always in exactly one state there.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    Estopped,
    Errored,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstanceState::Running => "running",
            InstanceState::Estopped => "estopped",
            InstanceState::Errored => "errored",
        })
    }
}

/// Live instances of one operation.
pub type OperationStatus = BTreeMap<Uuid, InstanceState>;

/// Full replacement of one server's `operation → instances` map.
///
/// Operations absent from a delta are left untouched by the receiver.
pub type StatusDelta = BTreeMap<String, OperationStatus>;

/// Body of a status push from an action server to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub server: String,
    pub status: StatusDelta,
}

// ---------------------------------------------------------------------------
// Delta reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationReport {
    pub operation: String,
    pub started: Vec<Uuid>,
    pub finished: Vec<Uuid>,
    pub ongoing: Vec<Uuid>,
}

/// What changed when a delta was applied. Used for logging and for the
/// automatic emergency-stop trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeltaReport {
    pub server: String,
    pub operations: Vec<OperationReport>,
    /// Ids that were not estopped before this delta and are now.
    pub new_estops: Vec<Uuid>,
    /// Ids that were not errored before this delta and are now.
    pub new_errors: Vec<Uuid>,
}

impl DeltaReport {
    pub fn log(&self) {
        for op in &self.operations {
            if !op.started.is_empty() || !op.finished.is_empty() {
                info!(
                    server = %self.server,
                    operation = %op.operation,
                    started = ?op.started,
                    finished = ?op.finished,
                    ongoing = op.ongoing.len(),
                    "status delta applied"
                );
            } else {
                debug!(
                    server = %self.server,
                    operation = %op.operation,
                    ongoing = op.ongoing.len(),
                    "status delta applied, no change"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalState {
    #[default]
    Idle,
    Busy,
    Error,
}

impl fmt::Display for GlobalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GlobalState::Idle => "idle",
            GlobalState::Busy => "busy",
            GlobalState::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveInstance {
    pub server: String,
    pub operation: String,
    pub id: Uuid,
    pub state: InstanceState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub running: Vec<LiveInstance>,
    pub estopped: Vec<LiveInstance>,
    pub errored: Vec<LiveInstance>,
}

impl Classification {
    pub fn global_state(&self) -> GlobalState {
        if self.running.is_empty() && self.estopped.is_empty() {
            GlobalState::Idle
        } else if !self.errored.is_empty() {
            GlobalState::Error
        } else {
            GlobalState::Busy
        }
    }
}

// ---------------------------------------------------------------------------
// StatusTable
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusTable {
    servers: BTreeMap<String, BTreeMap<String, OperationStatus>>,
}

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `table[server][op]` with `delta[op]` for every operation in
    /// the delta. Nothing accumulates across deltas.
    pub fn apply_delta(&mut self, server: &str, delta: &StatusDelta) -> DeltaReport {
        let ops = self.servers.entry(server.to_string()).or_default();
        let mut report = DeltaReport {
            server: server.to_string(),
            ..DeltaReport::default()
        };

        for (operation, next) in delta {
            let prev = ops.insert(operation.clone(), next.clone()).unwrap_or_default();

            let prev_ids: BTreeSet<&Uuid> = prev.keys().collect();
            let next_ids: BTreeSet<&Uuid> = next.keys().collect();
            report.operations.push(OperationReport {
                operation: operation.clone(),
                started: next_ids.difference(&prev_ids).map(|id| **id).collect(),
                finished: prev_ids.difference(&next_ids).map(|id| **id).collect(),
                ongoing: next_ids.intersection(&prev_ids).map(|id| **id).collect(),
            });

            for (id, state) in next {
                let before = prev.get(id);
                match state {
                    InstanceState::Estopped if before != Some(&InstanceState::Estopped) => {
                        report.new_estops.push(*id)
                    }
                    InstanceState::Errored if before != Some(&InstanceState::Errored) => {
                        report.new_errors.push(*id)
                    }
                    _ => {}
                }
            }
        }

        report
    }

    pub fn operation(&self, server: &str, operation: &str) -> Option<&OperationStatus> {
        self.servers.get(server)?.get(operation)
    }

    pub fn server(&self, server: &str) -> Option<&BTreeMap<String, OperationStatus>> {
        self.servers.get(server)
    }

    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    /// Every live instance in table order.
    pub fn instances(&self) -> impl Iterator<Item = LiveInstance> + '_ {
        self.servers.iter().flat_map(|(server, ops)| {
            ops.iter().flat_map(move |(operation, ids)| {
                ids.iter().map(move |(id, state)| LiveInstance {
                    server: server.clone(),
                    operation: operation.clone(),
                    id: *id,
                    state: *state,
                })
            })
        })
    }

    /// Split every instance by state. Pure.
    pub fn classify(&self) -> Classification {
        let mut c = Classification::default();
        for inst in self.instances() {
            match inst.state {
                InstanceState::Running => c.running.push(inst),
                InstanceState::Estopped => c.estopped.push(inst),
                InstanceState::Errored => c.errored.push(inst),
            }
        }
        c
    }

    pub fn global_state(&self) -> GlobalState {
        self.classify().global_state()
    }

    fn running_in(ops: &OperationStatus) -> bool {
        ops.values().any(|s| *s == InstanceState::Running)
    }

    /// No running instance of `server/operation`.
    pub fn endpoint_idle(&self, server: &str, operation: &str) -> bool {
        self.operation(server, operation)
            .map(|ops| !Self::running_in(ops))
            .unwrap_or(true)
    }

    /// No running instance of any operation on `server`.
    pub fn server_idle(&self, server: &str) -> bool {
        self.servers
            .get(server)
            .map(|ops| !ops.values().any(Self::running_in))
            .unwrap_or(true)
    }

    /// No running instance anywhere.
    pub fn all_idle(&self) -> bool {
        !self
            .servers
            .values()
            .flat_map(|ops| ops.values())
            .any(Self::running_in)
    }

    pub fn endpoints_idle<'a>(&self, endpoints: impl IntoIterator<Item = &'a Endpoint>) -> bool {
        endpoints
            .into_iter()
            .all(|e| self.endpoint_idle(&e.server, &e.operation))
    }

    /// Distinct servers holding at least one id in `state`.
    pub fn servers_with(&self, state: InstanceState) -> BTreeSet<String> {
        self.instances()
            .filter(|i| i.state == state)
            .map(|i| i.server)
            .collect()
    }

    /// Remove every estopped and/or errored id. Returns what was removed.
    pub fn clear(&mut self, estop: bool, error: bool) -> Vec<LiveInstance> {
        let removed: Vec<LiveInstance> = self
            .instances()
            .filter(|i| match i.state {
                InstanceState::Estopped => estop,
                InstanceState::Errored => error,
                InstanceState::Running => false,
            })
            .collect();
        for inst in &removed {
            if let Some(ids) = self
                .servers
                .get_mut(&inst.server)
                .and_then(|ops| ops.get_mut(&inst.operation))
            {
                ids.remove(&inst.id);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(op: &str, ids: &[(Uuid, InstanceState)]) -> StatusDelta {
        let mut d = StatusDelta::new();
        d.insert(op.to_string(), ids.iter().copied().collect());
        d
    }

    #[test]
    fn apply_delta_replaces_without_accumulating() {
        let mut t = StatusTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        t.apply_delta("pstat", &delta("run_cv", &[(a, InstanceState::Running)]));
        t.apply_delta("pstat", &delta("run_cv", &[(b, InstanceState::Running)]));
        let ops = t.operation("pstat", "run_cv").unwrap();
        assert_eq!(ops.len(), 1);
        assert!(ops.contains_key(&b));
    }

    #[test]
    fn apply_delta_reports_started_finished_ongoing() {
        let mut t = StatusTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        t.apply_delta("pstat", &delta("run", &[(a, InstanceState::Running)]));
        let report = t.apply_delta(
            "pstat",
            &delta("run", &[(a, InstanceState::Running), (b, InstanceState::Running)]),
        );
        assert_eq!(report.operations[0].started, vec![b]);
        assert_eq!(report.operations[0].ongoing, vec![a]);
        assert!(report.operations[0].finished.is_empty());

        let report = t.apply_delta("pstat", &delta("run", &[]));
        let mut finished = report.operations[0].finished.clone();
        finished.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(finished, expected);
    }

    #[test]
    fn untouched_operations_survive_delta() {
        let mut t = StatusTable::new();
        let a = Uuid::new_v4();
        t.apply_delta("motion", &delta("move", &[(a, InstanceState::Running)]));
        t.apply_delta("motion", &delta("home", &[]));
        assert!(!t.endpoint_idle("motion", "move"));
        assert!(t.endpoint_idle("motion", "home"));
    }

    #[test]
    fn new_estop_detected_once() {
        let mut t = StatusTable::new();
        let a = Uuid::new_v4();
        let r = t.apply_delta("pstat", &delta("run", &[(a, InstanceState::Estopped)]));
        assert_eq!(r.new_estops, vec![a]);
        let r = t.apply_delta("pstat", &delta("run", &[(a, InstanceState::Estopped)]));
        assert!(r.new_estops.is_empty());
    }

    #[test]
    fn classify_is_pure_and_idempotent() {
        let mut t = StatusTable::new();
        t.apply_delta(
            "pstat",
            &delta(
                "run",
                &[
                    (Uuid::new_v4(), InstanceState::Running),
                    (Uuid::new_v4(), InstanceState::Errored),
                ],
            ),
        );
        let before = t.clone();
        let first = t.classify();
        let second = t.classify();
        assert_eq!(first, second);
        assert_eq!(t, before);
        assert_eq!(first.running.len(), 1);
        assert_eq!(first.errored.len(), 1);
    }

    #[test]
    fn global_state_rules() {
        let mut t = StatusTable::new();
        assert_eq!(t.global_state(), GlobalState::Idle);

        let run = Uuid::new_v4();
        t.apply_delta("pstat", &delta("run", &[(run, InstanceState::Running)]));
        assert_eq!(t.global_state(), GlobalState::Busy);

        let err = Uuid::new_v4();
        t.apply_delta("motion", &delta("move", &[(err, InstanceState::Errored)]));
        assert_eq!(t.global_state(), GlobalState::Error);

        // An error with nothing running and no estop still reads idle.
        t.apply_delta("pstat", &delta("run", &[]));
        assert_eq!(t.global_state(), GlobalState::Idle);

        t.apply_delta(
            "pstat",
            &delta("run", &[(Uuid::new_v4(), InstanceState::Estopped)]),
        );
        assert_eq!(t.global_state(), GlobalState::Error);
    }

    #[test]
    fn idle_checks_ignore_tagged_ids() {
        let mut t = StatusTable::new();
        t.apply_delta(
            "pstat",
            &delta("run", &[(Uuid::new_v4(), InstanceState::Errored)]),
        );
        assert!(t.endpoint_idle("pstat", "run"));
        assert!(t.server_idle("pstat"));
        assert!(t.all_idle());
        assert!(t.endpoint_idle("unknown", "op"));
    }

    #[test]
    fn clear_removes_only_requested_tags() {
        let mut t = StatusTable::new();
        let run = Uuid::new_v4();
        let stop = Uuid::new_v4();
        let err = Uuid::new_v4();
        t.apply_delta(
            "pstat",
            &delta(
                "run",
                &[
                    (run, InstanceState::Running),
                    (stop, InstanceState::Estopped),
                    (err, InstanceState::Errored),
                ],
            ),
        );
        let removed = t.clear(true, false);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, stop);
        let ops = t.operation("pstat", "run").unwrap();
        assert!(ops.contains_key(&run));
        assert!(ops.contains_key(&err));
        assert_eq!(t.servers_with(InstanceState::Errored).len(), 1);
    }
}
