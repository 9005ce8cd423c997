//! # Orchestrator
//!
//! The dispatch state machine. One actor task owns both queues, the active
//! process group and the loop flags; every caller talks to it through an
//! [`Orchestrator`] handle that sends a [`Command`] and awaits a oneshot reply.
//!
//! ```text
//!  Orchestrator (handle) ──Command──► Dispatcher task ──dispatch──► ActionTransport
//!         │                               ▲      ▲
//!         └── push_status ──► StatusTracker ──┘      └── EstopSignal
//!                             (table snapshots)
//! ```
//!
//! ## Loop states
//!
//! | state     | meaning                                            |
//! |-----------|----------------------------------------------------|
//! | `stopped` | nothing is dispatched                              |
//! | `started` | the loop walks the queues                          |
//! | `E-STOP`  | halted; only `clear_estate` leaves this state      |
//!
//! `skip` and `stop` are intents observed at the next loop top; an in-flight
//! dispatch always completes. `estop` drops the in-flight step immediately.

pub mod condition;
mod dispatcher;
pub mod queue;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::LabConfig;
use crate::error::{OrchError, Result};
use crate::model::{Action, ProcessGroup, ProcessGroupRef, SequenceNumber};
use crate::plan::PlanLibrary;
use crate::status::{
    Classification, GlobalState, LiveInstance, StatusMessage, StatusTracker, TableSnapshot,
};
use crate::transport::ActionTransport;

use dispatcher::Dispatcher;

// ---------------------------------------------------------------------------
// Loop flags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    #[default]
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "E-STOP")]
    Estop,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopState::Stopped => "stopped",
            LoopState::Started => "started",
            LoopState::Estop => "E-STOP",
        })
    }
}

/// Pending request observed at the next loop top. Last write wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopIntent {
    #[default]
    None,
    Skip,
    Stop,
}

impl fmt::Display for LoopIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopIntent::None => "none",
            LoopIntent::Skip => "skip",
            LoopIntent::Stop => "stop",
        })
    }
}

/// Where a queue insertion lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    Back,
    Front,
    Index(usize),
}

/// Point-in-time view of the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub name: String,
    pub loop_state: LoopState,
    pub intent: LoopIntent,
    pub global_state: GlobalState,
    pub active_process_group: Option<ProcessGroupRef>,
    pub last_process_group: Option<ProcessGroupRef>,
    pub queued_process_groups: usize,
    pub queued_actions: usize,
    /// Sequence number of the action being waited on or dispatched, if any.
    pub in_flight: Option<SequenceNumber>,
    pub results: usize,
    pub table_revision: u64,
    pub classification: Classification,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum Command {
    Start {
        response: oneshot::Sender<Result<LoopState>>,
    },
    Stop {
        response: oneshot::Sender<LoopIntent>,
    },
    Skip {
        response: oneshot::Sender<LoopIntent>,
    },
    Estop {
        response: oneshot::Sender<()>,
    },
    ClearEstate {
        estop: bool,
        error: bool,
        response: oneshot::Sender<LoopState>,
    },
    AddGroup {
        group: Box<ProcessGroup>,
        position: Position,
        response: oneshot::Sender<Result<()>>,
    },
    RemoveGroup {
        index: usize,
        response: oneshot::Sender<Result<ProcessGroup>>,
    },
    ClearGroups {
        response: oneshot::Sender<usize>,
    },
    ListGroups {
        response: oneshot::Sender<Vec<ProcessGroup>>,
    },
    ActiveGroup {
        response: oneshot::Sender<Option<ProcessGroup>>,
    },
    LastGroup {
        response: oneshot::Sender<Option<ProcessGroup>>,
    },
    AddAction {
        action: Box<Action>,
        position: Position,
        response: oneshot::Sender<Result<SequenceNumber>>,
    },
    RemoveAction {
        sequence: SequenceNumber,
        response: oneshot::Sender<Result<Action>>,
    },
    Supplement {
        after: SequenceNumber,
        actions: Vec<Action>,
        response: oneshot::Sender<Result<Vec<SequenceNumber>>>,
    },
    ClearActions {
        response: oneshot::Sender<usize>,
    },
    ListActions {
        response: oneshot::Sender<Vec<Action>>,
    },
    Status {
        response: oneshot::Sender<OrchestratorStatus>,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Knobs for the dispatcher that are not part of the transport or plans.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub name: String,
    pub start_condition_timeout: Option<std::time::Duration>,
}

impl OrchestratorOptions {
    pub fn from_config(config: &LabConfig) -> Self {
        Self {
            name: config.orchestrator.name.clone(),
            start_condition_timeout: config.start_condition_timeout(),
        }
    }
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            name: "orch".to_string(),
            start_condition_timeout: None,
        }
    }
}

/// Cloneable handle to a running dispatcher.
#[derive(Clone)]
pub struct Orchestrator {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    tracker: Arc<StatusTracker>,
    task: Arc<JoinHandle<()>>,
}

impl Orchestrator {
    /// Spawn the status tracker and the dispatcher task.
    pub fn spawn(
        options: OrchestratorOptions,
        plans: PlanLibrary,
        transport: Arc<dyn ActionTransport>,
    ) -> Self {
        let (estop_tx, estop_rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(StatusTracker::spawn(Some(estop_tx)));
        let (tx, rx) = mpsc::unbounded_channel();
        let name: Arc<str> = Arc::from(options.name.as_str());
        let dispatcher = Dispatcher::new(options, plans, transport, Arc::clone(&tracker));
        let task = tokio::spawn(dispatcher.run(rx, estop_rx));
        Self {
            name,
            commands: tx,
            tracker,
            task: Arc::new(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(build(tx)).map_err(|_| OrchError::Closed)?;
        rx.await.map_err(|_| OrchError::Closed)
    }

    // -- lifecycle ----------------------------------------------------------

    /// `stopped → started` when either queue holds work. Refused in `E-STOP`.
    pub async fn start(&self) -> Result<LoopState> {
        self.request(|response| Command::Start { response }).await?
    }

    /// Finish the in-flight action, wait for idle, then stop.
    pub async fn stop(&self) -> Result<LoopIntent> {
        self.request(|response| Command::Stop { response }).await
    }

    /// Abandon the rest of the active process group.
    pub async fn skip(&self) -> Result<LoopIntent> {
        self.request(|response| Command::Skip { response }).await
    }

    /// Halt the loop and force-stop every server holding a running instance.
    pub async fn estop(&self) -> Result<()> {
        self.request(|response| Command::Estop { response }).await
    }

    /// Drop estopped and/or errored instances and force `stopped`.
    pub async fn clear_estate(&self, estop: bool, error: bool) -> Result<LoopState> {
        self.request(|response| Command::ClearEstate {
            estop,
            error,
            response,
        })
        .await
    }

    // -- process groups -----------------------------------------------------

    pub async fn add_process_group(&self, group: ProcessGroup, position: Position) -> Result<()> {
        self.request(|response| Command::AddGroup {
            group: Box::new(group),
            position,
            response,
        })
        .await?
    }

    pub async fn append_process_group(&self, group: ProcessGroup) -> Result<()> {
        self.add_process_group(group, Position::Back).await
    }

    pub async fn prepend_process_group(&self, group: ProcessGroup) -> Result<()> {
        self.add_process_group(group, Position::Front).await
    }

    pub async fn remove_process_group(&self, index: usize) -> Result<ProcessGroup> {
        self.request(|response| Command::RemoveGroup { index, response })
            .await?
    }

    pub async fn clear_process_groups(&self) -> Result<usize> {
        self.request(|response| Command::ClearGroups { response })
            .await
    }

    pub async fn list_process_groups(&self) -> Result<Vec<ProcessGroup>> {
        self.request(|response| Command::ListGroups { response })
            .await
    }

    pub async fn active_process_group(&self) -> Result<Option<ProcessGroup>> {
        self.request(|response| Command::ActiveGroup { response })
            .await
    }

    pub async fn last_process_group(&self) -> Result<Option<ProcessGroup>> {
        self.request(|response| Command::LastGroup { response })
            .await
    }

    // -- actions ------------------------------------------------------------

    /// Queue a single action. Appended actions are numbered after every
    /// pending and completed one; the caller's number is kept otherwise.
    pub async fn add_action(&self, action: Action, position: Position) -> Result<SequenceNumber> {
        self.request(|response| Command::AddAction {
            action: Box::new(action),
            position,
            response,
        })
        .await?
    }

    pub async fn remove_action(&self, sequence: SequenceNumber) -> Result<Action> {
        self.request(|response| Command::RemoveAction { sequence, response })
            .await?
    }

    /// Insert `actions` right after sequence number `after`.
    pub async fn supplement_actions(
        &self,
        after: SequenceNumber,
        actions: Vec<Action>,
    ) -> Result<Vec<SequenceNumber>> {
        self.request(|response| Command::Supplement {
            after,
            actions,
            response,
        })
        .await?
    }

    pub async fn clear_actions(&self) -> Result<usize> {
        self.request(|response| Command::ClearActions { response })
            .await
    }

    pub async fn list_actions(&self) -> Result<Vec<Action>> {
        self.request(|response| Command::ListActions { response })
            .await
    }

    // -- status -------------------------------------------------------------

    pub async fn status(&self) -> Result<OrchestratorStatus> {
        self.request(|response| Command::Status { response }).await
    }

    /// Every live instance in the table, whatever its state.
    pub fn active_actions(&self) -> Vec<LiveInstance> {
        self.tracker.snapshot().table.instances().collect()
    }

    /// Accept a pushed status delta. Never blocks on the dispatcher.
    pub fn push_status(&self, msg: StatusMessage) {
        self.tracker.push(msg);
    }

    pub fn table(&self) -> TableSnapshot {
        self.tracker.snapshot()
    }

    /// Table snapshots, republished after every applied update.
    pub fn watch(&self) -> watch::Receiver<TableSnapshot> {
        self.tracker.watch()
    }

    pub async fn wait_for_revision(&self, revision: u64) -> TableSnapshot {
        self.tracker.wait_for_revision(revision).await
    }

    /// Stop the dispatcher task. Later requests fail with `Closed`.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
