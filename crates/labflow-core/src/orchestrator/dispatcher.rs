//! The dispatcher actor: sole owner of queues, flags and the active group.

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::condition::wait_for_start;
use super::queue::{ActionQueue, ProcessGroupQueue};
use super::{Command, LoopIntent, LoopState, OrchestratorOptions, OrchestratorStatus, Position};
use crate::error::{OrchError, Result};
use crate::model::{Action, ProcessGroup, SequenceNumber};
use crate::plan::PlanLibrary;
use crate::status::{EstopSignal, GlobalState, InstanceState, StatusTracker};
use crate::transport::ActionTransport;

/// Plan name given to the implicit group that owns manually queued actions.
pub const MANUAL_PLAN: &str = "manual";

enum StepOutcome {
    Dispatched {
        sequence: SequenceNumber,
        result: Result<Action>,
    },
    Drained,
}

enum Event {
    Command(Option<Command>),
    Estop(EstopSignal),
    Step(StepOutcome),
}

pub(super) struct Dispatcher {
    name: String,
    start_timeout: Option<Duration>,
    plans: PlanLibrary,
    transport: Arc<dyn ActionTransport>,
    tracker: Arc<StatusTracker>,

    state: LoopState,
    intent: LoopIntent,
    groups: ProcessGroupQueue,
    actions: ActionQueue,
    active: Option<ProcessGroup>,
    last: Option<ProcessGroup>,
    /// Ids handed out for the active group, by sequence number.
    dispatched: BTreeMap<SequenceNumber, Uuid>,
    /// The one suspended piece of loop work: a start-condition wait plus its
    /// dispatch, or the drain before a requested stop.
    step: Option<BoxFuture<'static, StepOutcome>>,
    in_flight: Option<SequenceNumber>,
}

async fn next_step(step: &mut Option<BoxFuture<'static, StepOutcome>>) -> StepOutcome {
    match step {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

impl Dispatcher {
    pub(super) fn new(
        options: OrchestratorOptions,
        plans: PlanLibrary,
        transport: Arc<dyn ActionTransport>,
        tracker: Arc<StatusTracker>,
    ) -> Self {
        Self {
            name: options.name,
            start_timeout: options.start_condition_timeout,
            plans,
            transport,
            tracker,
            state: LoopState::Stopped,
            intent: LoopIntent::None,
            groups: ProcessGroupQueue::default(),
            actions: ActionQueue::default(),
            active: None,
            last: None,
            dispatched: BTreeMap::new(),
            step: None,
            in_flight: None,
        }
    }

    pub(super) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut estops: mpsc::UnboundedReceiver<EstopSignal>,
    ) {
        info!(orchestrator = %self.name, "dispatcher started");
        loop {
            let event = tokio::select! {
                cmd = commands.recv() => Event::Command(cmd),
                Some(signal) = estops.recv() => Event::Estop(signal),
                outcome = next_step(&mut self.step) => Event::Step(outcome),
            };
            match event {
                Event::Command(None) | Event::Command(Some(Command::Shutdown)) => break,
                Event::Command(Some(cmd)) => self.handle(cmd).await,
                Event::Estop(signal) => {
                    if self.state == LoopState::Started {
                        warn!(
                            server = %signal.server,
                            ids = ?signal.ids,
                            "emergency stop reported by action server"
                        );
                        self.estop().await;
                    }
                }
                Event::Step(outcome) => {
                    self.step = None;
                    self.complete(outcome);
                }
            }
            self.advance();
        }
        info!(orchestrator = %self.name, "dispatcher stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Start { response } => {
                let _ = response.send(self.start());
            }
            Command::Stop { response } => {
                if self.state == LoopState::Started {
                    self.intent = LoopIntent::Stop;
                    info!("stop requested");
                }
                let _ = response.send(self.intent);
            }
            Command::Skip { response } => {
                if self.state == LoopState::Started {
                    self.intent = LoopIntent::Skip;
                    info!("skip requested");
                }
                let _ = response.send(self.intent);
            }
            Command::Estop { response } => {
                self.estop().await;
                let _ = response.send(());
            }
            Command::ClearEstate {
                estop,
                error,
                response,
            } => {
                self.clear_estate(estop, error).await;
                let _ = response.send(self.state);
            }
            Command::AddGroup {
                group,
                position,
                response,
            } => {
                let _ = response.send(self.add_group(*group, position));
            }
            Command::RemoveGroup { index, response } => {
                let _ = response.send(self.groups.remove(index));
            }
            Command::ClearGroups { response } => {
                let _ = response.send(self.groups.clear());
            }
            Command::ListGroups { response } => {
                let _ = response.send(self.groups.list());
            }
            Command::ActiveGroup { response } => {
                let _ = response.send(self.active.clone());
            }
            Command::LastGroup { response } => {
                let _ = response.send(self.last.clone());
            }
            Command::AddAction {
                action,
                position,
                response,
            } => {
                let _ = response.send(self.add_action(*action, position));
            }
            Command::RemoveAction { sequence, response } => {
                let _ = response.send(self.actions.remove_sequence(sequence));
            }
            Command::Supplement {
                after,
                actions,
                response,
            } => {
                let checked = actions.iter().try_for_each(Action::validate);
                let result = checked.map(|()| self.actions.supplement(after, actions));
                let _ = response.send(result);
            }
            Command::ClearActions { response } => {
                let _ = response.send(self.actions.clear());
            }
            Command::ListActions { response } => {
                let _ = response.send(self.actions.list());
            }
            Command::Status { response } => {
                let _ = response.send(self.status());
            }
            Command::Shutdown => {}
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    fn start(&mut self) -> Result<LoopState> {
        match self.state {
            LoopState::Estop => Err(OrchError::InvalidState(
                "emergency stop is engaged; clear it before starting".into(),
            )),
            LoopState::Started => Ok(LoopState::Started),
            LoopState::Stopped => {
                if self.groups.is_empty() && self.actions.is_empty() {
                    info!("nothing queued, staying stopped");
                } else {
                    self.state = LoopState::Started;
                    self.intent = LoopIntent::None;
                    info!(
                        groups = self.groups.len(),
                        actions = self.actions.len(),
                        "dispatch loop started"
                    );
                }
                Ok(self.state)
            }
        }
    }

    async fn estop(&mut self) {
        if self.state == LoopState::Estop {
            debug!("emergency stop already engaged");
            return;
        }
        self.state = LoopState::Estop;
        self.intent = LoopIntent::None;
        if self.step.take().is_some() {
            warn!(sequence = ?self.in_flight, "cancelled in-flight step");
        }
        self.in_flight = None;

        // Every server still holding a live id that is not already estopped.
        let servers: BTreeSet<String> = self
            .tracker
            .snapshot()
            .table
            .instances()
            .filter(|inst| inst.state != InstanceState::Estopped)
            .map(|inst| inst.server)
            .collect();
        error!(servers = ?servers, "EMERGENCY STOP");
        let calls = servers.iter().map(|server| {
            let transport = Arc::clone(&self.transport);
            async move { (server, transport.estop(server, true).await) }
        });
        for (server, result) in join_all(calls).await {
            if let Err(e) = result {
                error!(server = %server, error = %e, "force-stop request failed");
            }
        }
    }

    async fn clear_estate(&mut self, estop: bool, error: bool) {
        let table = self.tracker.snapshot().table;
        self.tracker.clear(estop, error);

        if estop {
            for server in table.servers_with(InstanceState::Estopped) {
                if let Err(e) = self.transport.estop(&server, false).await {
                    error!(server = %server, error = %e, "estop release failed");
                }
            }
        }
        if error {
            for server in table.servers_with(InstanceState::Errored) {
                if let Err(e) = self.transport.clear_error(&server).await {
                    error!(server = %server, error = %e, "error clear failed");
                }
            }
        }

        self.state = LoopState::Stopped;
        self.intent = LoopIntent::None;
        info!(estop, error, "cleared status table, loop stopped");
    }

    // -----------------------------------------------------------------------
    // Queue surgery
    // -----------------------------------------------------------------------

    fn add_group(&mut self, mut group: ProcessGroup, position: Position) -> Result<()> {
        if !self.plans.contains(&group.plan) {
            return Err(OrchError::UnknownPlan(group.plan));
        }
        if group.orchestrator.is_empty() {
            group.orchestrator = self.name.clone();
        }
        info!(plan = %group.plan, label = %group.label, ?position, "queued process group");
        match position {
            Position::Back => self.groups.push_back(group),
            Position::Front => self.groups.push_front(group),
            Position::Index(i) => self.groups.insert(i, group),
        }
        Ok(())
    }

    fn add_action(&mut self, mut action: Action, position: Position) -> Result<SequenceNumber> {
        action.validate()?;
        if position == Position::Back {
            action.sequence = self.next_sequence();
        }
        let sequence = action.sequence;
        match position {
            Position::Back => self.actions.push_back(action),
            Position::Front => self.actions.push_front(action),
            Position::Index(i) => self.actions.insert(i, action),
        }
        Ok(sequence)
    }

    /// One past the highest whole number used by pending or dispatched actions.
    fn next_sequence(&self) -> SequenceNumber {
        let pending = self.actions.list().into_iter().map(|a| a.sequence);
        let used = self.dispatched.keys().copied();
        match pending.chain(used).max() {
            Some(max) => SequenceNumber::from(max.value().floor() + 1.0),
            None => SequenceNumber::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Loop body
    // -----------------------------------------------------------------------

    /// Run loop tops until the loop suspends on a step or leaves `started`.
    fn advance(&mut self) {
        while self.state == LoopState::Started && self.step.is_none() {
            if self.actions.is_empty() && !self.groups.is_empty() {
                self.activate_next_group();
            } else if self.intent == LoopIntent::Stop {
                let mut rx = self.tracker.watch();
                info!("stop intent: waiting for idle");
                self.step = Some(Box::pin(async move {
                    let _ = rx.wait_for(|s| s.global_state == GlobalState::Idle).await;
                    StepOutcome::Drained
                }));
            } else if self.intent == LoopIntent::Skip {
                let dropped = self.actions.clear();
                info!(dropped, "skipped rest of process group");
                self.intent = LoopIntent::None;
            } else if let Some(action) = self.actions.pop_front() {
                self.dispatch(action);
            } else {
                if let Some(done) = self.active.take() {
                    info!(label = %done.label, results = done.results.len(), "process group finished");
                    self.last = Some(done);
                }
                self.state = LoopState::Stopped;
                info!("queues exhausted, loop stopped");
            }
        }
    }

    fn activate_next_group(&mut self) {
        let Some(mut group) = self.groups.pop_front() else {
            return;
        };
        if let Some(done) = self.active.take() {
            self.last = Some(done);
        }
        let reference = group.activate();
        self.dispatched.clear();
        match self.plans.expand(&group) {
            Ok(actions) => {
                info!(
                    pg_id = %reference.id,
                    label = %reference.label,
                    actions = actions.len(),
                    "process group activated"
                );
                self.actions.replace(actions);
                self.active = Some(group);
            }
            Err(e) => {
                error!(label = %reference.label, error = %e, "plan expansion failed, stopping");
                self.last = Some(group);
                self.state = LoopState::Stopped;
                self.intent = LoopIntent::None;
            }
        }
    }

    fn dispatch(&mut self, mut action: Action) {
        let name = self.name.clone();
        let group = self.active.get_or_insert_with(|| {
            let mut g = ProcessGroup::new(MANUAL_PLAN, MANUAL_PLAN);
            g.orchestrator = name;
            g.activate();
            g
        });

        let id = Uuid::new_v4();
        action.id = Some(id);
        action.orchestrator = Some(self.name.clone());
        action.process_group = group.reference();
        group.pull_into(&mut action);
        self.dispatched.insert(action.sequence, id);
        self.in_flight = Some(action.sequence);
        debug!(
            action_id = %id,
            server = %action.server,
            operation = %action.operation,
            sequence = %action.sequence,
            "waiting on start condition"
        );

        let transport = Arc::clone(&self.transport);
        let mut rx = self.tracker.watch();
        let timeout = self.start_timeout;
        let sequence = action.sequence;
        self.step = Some(Box::pin(async move {
            let result = async {
                wait_for_start(&mut rx, &action, timeout).await?;
                action.dispatched_at = Some(Utc::now());
                info!(
                    action_id = %id,
                    server = %action.server,
                    operation = %action.operation,
                    sequence = %action.sequence,
                    "dispatching"
                );
                Ok(transport.dispatch(&action).await?)
            }
            .await;
            StepOutcome::Dispatched { sequence, result }
        }));
    }

    fn complete(&mut self, outcome: StepOutcome) {
        self.in_flight = None;
        match outcome {
            StepOutcome::Dispatched {
                sequence,
                result: Ok(response),
            } => {
                if let Some(err) = &response.error {
                    warn!(
                        server = %response.server,
                        operation = %response.operation,
                        sequence = %sequence,
                        error = %err,
                        "action server declared an error"
                    );
                }
                if let Some(group) = self.active.as_mut() {
                    group.push_from(&response);
                    group.results.insert(sequence, response);
                }
            }
            StepOutcome::Dispatched {
                sequence,
                result: Err(e),
            } => {
                error!(sequence = %sequence, error = %e, "dispatch failed, stopping loop");
                self.state = LoopState::Stopped;
                self.intent = LoopIntent::None;
            }
            StepOutcome::Drained => {
                info!("idle reached, loop stopped");
                self.state = LoopState::Stopped;
                self.intent = LoopIntent::None;
            }
        }
    }

    fn status(&self) -> OrchestratorStatus {
        let snapshot = self.tracker.snapshot();
        OrchestratorStatus {
            name: self.name.clone(),
            loop_state: self.state,
            intent: self.intent,
            global_state: snapshot.global_state,
            active_process_group: self.active.as_ref().and_then(ProcessGroup::reference),
            last_process_group: self.last.as_ref().and_then(ProcessGroup::reference),
            queued_process_groups: self.groups.len(),
            queued_actions: self.actions.len(),
            in_flight: self.in_flight,
            results: self.active.as_ref().map_or(0, |g| g.results.len()),
            table_revision: snapshot.revision,
            classification: snapshot.table.classify(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::model::{Endpoint, StartCondition};
    use crate::orchestrator::Orchestrator;
    use crate::status::{StatusDelta, StatusMessage};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records every call; optionally fails dispatches to one server.
    #[derive(Default)]
    struct FakeTransport {
        dispatched: Mutex<Vec<Action>>,
        estops: Mutex<Vec<(String, bool)>>,
        cleared: Mutex<Vec<String>>,
        fail_server: Option<String>,
    }

    #[async_trait]
    impl ActionTransport for FakeTransport {
        async fn dispatch(&self, action: &Action) -> std::result::Result<Action, TransportError> {
            if self.fail_server.as_deref() == Some(action.server.as_str()) {
                return Err(TransportError::Request {
                    url: action.server.clone(),
                    message: "connection refused".into(),
                });
            }
            let mut response = action.clone();
            response.process_params.insert("echo".into(), json!(action.operation));
            self.dispatched.lock().unwrap().push(action.clone());
            Ok(response)
        }

        async fn estop(&self, server: &str, engage: bool) -> std::result::Result<(), TransportError> {
            self.estops.lock().unwrap().push((server.to_string(), engage));
            Ok(())
        }

        async fn clear_error(&self, server: &str) -> std::result::Result<(), TransportError> {
            self.cleared.lock().unwrap().push(server.to_string());
            Ok(())
        }

        async fn subscribe(&self, _: &str, _: &str) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    impl FakeTransport {
        fn count(&self) -> usize {
            self.dispatched.lock().unwrap().len()
        }
    }

    fn spawn(transport: Arc<FakeTransport>) -> Orchestrator {
        Orchestrator::spawn(
            OrchestratorOptions::default(),
            PlanLibrary::with_builtins(),
            transport,
        )
    }

    fn no_wait(op: &str) -> serde_json::Value {
        json!({"server": "sim", "operation": op, "start_condition": {"type": "no_wait"}})
    }

    fn running(server: &str, op: &str, ids: &[(Uuid, InstanceState)]) -> StatusMessage {
        let mut status = StatusDelta::new();
        status.insert(op.to_string(), ids.iter().copied().collect());
        StatusMessage {
            server: server.to_string(),
            status,
        }
    }

    async fn wait_until_stopped(orch: &Orchestrator) -> OrchestratorStatus {
        for _ in 0..200 {
            let status = orch.status().await.unwrap();
            if status.loop_state != LoopState::Started {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("loop never stopped");
    }

    async fn wait_until_in_flight(orch: &Orchestrator, sequence: f64) {
        for _ in 0..200 {
            if orch.status().await.unwrap().in_flight == Some(SequenceNumber::from(sequence)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("action {sequence} never became in-flight");
    }

    #[tokio::test]
    async fn no_wait_actions_produce_one_result_each() {
        let transport = Arc::new(FakeTransport::default());
        let orch = spawn(transport.clone());
        let pg = ProcessGroup::new("sequence", "three").with_plan_param(
            "actions",
            json!([no_wait("a"), no_wait("b"), no_wait("c")]),
        );
        orch.append_process_group(pg).await.unwrap();
        assert_eq!(orch.start().await.unwrap(), LoopState::Started);

        let status = wait_until_stopped(&orch).await;
        assert_eq!(status.loop_state, LoopState::Stopped);
        assert_eq!(transport.count(), 3);
        // Nothing was ever pushed, so no table update was waited on.
        assert_eq!(status.table_revision, 0);

        let last = orch.last_process_group().await.unwrap().unwrap();
        let keys: Vec<f64> = last.results.keys().map(|k| k.value()).collect();
        assert_eq!(keys, vec![0.0, 1.0, 2.0]);
        assert_eq!(last.results[&SequenceNumber::from(1.0)].process_params["echo"], json!("b"));
    }

    #[tokio::test]
    async fn dispatch_carries_identity_and_global_params() {
        let transport = Arc::new(FakeTransport::default());
        let orch = spawn(transport.clone());
        let pg = ProcessGroup::new("sequence", "params")
            .with_global_param("ocv", 0.42)
            .with_plan_param(
                "actions",
                json!([{
                    "server": "pstat",
                    "operation": "run_cv",
                    "start_condition": {"type": "no_wait"},
                    "from_global_params": {"ocv": "start_potential"},
                    "to_global_params": ["echo"],
                }]),
            );
        orch.append_process_group(pg).await.unwrap();
        orch.start().await.unwrap();
        wait_until_stopped(&orch).await;

        let sent = transport.dispatched.lock().unwrap()[0].clone();
        assert!(sent.id.is_some());
        assert_eq!(sent.orchestrator.as_deref(), Some("orch"));
        assert_eq!(sent.process_group.as_ref().unwrap().label, "params");
        assert!(sent.dispatched_at.is_some());
        assert_eq!(sent.params["start_potential"], json!(0.42));

        let last = orch.last_process_group().await.unwrap().unwrap();
        assert_eq!(last.global_params["echo"], json!("run_cv"));
    }

    #[tokio::test]
    async fn wait_for_endpoint_blocks_until_delta_frees_it() {
        let transport = Arc::new(FakeTransport::default());
        let orch = spawn(transport.clone());
        let busy = Uuid::new_v4();
        orch.push_status(running("motion", "move", &[(busy, InstanceState::Running)]));
        orch.wait_for_revision(1).await;

        orch.add_action(
            Action::new("motion", "move").with_start_condition(StartCondition::WaitForEndpoint),
            Position::Back,
        )
        .await
        .unwrap();
        orch.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.count(), 0);
        assert_eq!(orch.status().await.unwrap().in_flight, Some(SequenceNumber::from(0.0)));

        orch.push_status(running("motion", "move", &[]));
        wait_until_stopped(&orch).await;
        assert_eq!(transport.count(), 1);
    }

    #[tokio::test]
    async fn wait_for_server_ignores_other_servers() {
        let transport = Arc::new(FakeTransport::default());
        let orch = spawn(transport.clone());
        let busy = Uuid::new_v4();
        orch.push_status(running("pstat", "run_cv", &[(busy, InstanceState::Running)]));
        orch.push_status(running("motion", "move", &[(Uuid::new_v4(), InstanceState::Running)]));
        orch.wait_for_revision(2).await;

        orch.add_action(
            Action::new("pstat", "run_ocv").with_start_condition(StartCondition::WaitForServer),
            Position::Back,
        )
        .await
        .unwrap();
        orch.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.count(), 0);

        // motion is still busy; only pstat matters.
        orch.push_status(running("pstat", "run_cv", &[]));
        wait_until_stopped(&orch).await;
        assert_eq!(transport.count(), 1);
        assert_eq!(transport.dispatched.lock().unwrap()[0].operation, "run_ocv");
    }

    #[tokio::test]
    async fn wait_for_named_endpoints_blocks_until_all_free() {
        let transport = Arc::new(FakeTransport::default());
        let orch = spawn(transport.clone());
        orch.push_status(running("motion", "move", &[(Uuid::new_v4(), InstanceState::Running)]));
        orch.push_status(running("pump", "dose", &[(Uuid::new_v4(), InstanceState::Running)]));
        orch.wait_for_revision(2).await;

        let endpoints = [Endpoint::new("motion", "move"), Endpoint::new("pump", "dose")]
            .into_iter()
            .collect();
        orch.add_action(
            Action::new("sim", "wait").with_start_condition(StartCondition::WaitFor { endpoints }),
            Position::Back,
        )
        .await
        .unwrap();
        orch.start().await.unwrap();

        orch.push_status(running("motion", "move", &[]));
        orch.wait_for_revision(3).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.count(), 0);

        orch.push_status(running("pump", "dose", &[]));
        wait_until_stopped(&orch).await;
        assert_eq!(transport.count(), 1);
    }

    #[tokio::test]
    async fn reported_estop_is_ignored_while_stopped() {
        let transport = Arc::new(FakeTransport::default());
        let orch = spawn(transport.clone());
        orch.push_status(running("pstat", "run_cv", &[(Uuid::new_v4(), InstanceState::Estopped)]));
        orch.wait_for_revision(1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let status = orch.status().await.unwrap();
        assert_eq!(status.loop_state, LoopState::Stopped);
        assert!(transport.estops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn estop_forces_each_busy_server_once() {
        let transport = Arc::new(FakeTransport::default());
        let orch = spawn(transport.clone());
        orch.push_status(running(
            "motion",
            "move",
            &[(Uuid::new_v4(), InstanceState::Running), (Uuid::new_v4(), InstanceState::Running)],
        ));
        orch.push_status(running("pstat", "run_cv", &[(Uuid::new_v4(), InstanceState::Running)]));
        orch.push_status(running("pump", "dose", &[(Uuid::new_v4(), InstanceState::Estopped)]));
        orch.push_status(running("robot", "pick", &[(Uuid::new_v4(), InstanceState::Errored)]));
        orch.wait_for_revision(4).await;

        // Parks the loop on a wait_for_all.
        orch.add_action(Action::new("sim", "wait"), Position::Back)
            .await
            .unwrap();
        orch.start().await.unwrap();

        orch.estop().await.unwrap();
        orch.estop().await.unwrap();
        let status = orch.status().await.unwrap();
        assert_eq!(status.loop_state, LoopState::Estop);
        assert_eq!(status.intent, LoopIntent::None);
        assert_eq!(status.in_flight, None);

        let mut calls = transport.estops.lock().unwrap().clone();
        calls.sort();
        assert_eq!(
            calls,
            vec![
                ("motion".to_string(), true),
                ("pstat".to_string(), true),
                ("robot".to_string(), true)
            ]
        );
        assert_eq!(transport.count(), 0);
        assert!(orch.start().await.is_err());
    }

    #[tokio::test]
    async fn reported_estop_halts_started_loop() {
        let transport = Arc::new(FakeTransport::default());
        let orch = spawn(transport.clone());
        let id = Uuid::new_v4();
        orch.push_status(running("pstat", "run_cv", &[(id, InstanceState::Running)]));
        orch.wait_for_revision(1).await;
        orch.add_action(Action::new("sim", "wait"), Position::Back)
            .await
            .unwrap();
        orch.start().await.unwrap();

        orch.push_status(running("pstat", "run_cv", &[(id, InstanceState::Estopped)]));
        for _ in 0..200 {
            if orch.status().await.unwrap().loop_state == LoopState::Estop {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(orch.status().await.unwrap().loop_state, LoopState::Estop);

        assert_eq!(orch.clear_estate(true, false).await.unwrap(), LoopState::Stopped);
        assert_eq!(
            transport.estops.lock().unwrap().clone(),
            vec![("pstat".to_string(), false)]
        );
        orch.wait_for_revision(3).await;
        assert!(orch.active_actions().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_stops_loop() {
        let transport = Arc::new(FakeTransport {
            fail_server: Some("down".into()),
            ..FakeTransport::default()
        });
        let orch = spawn(transport.clone());
        let pg = ProcessGroup::new("sequence", "x").with_plan_param(
            "actions",
            json!([
                no_wait("a"),
                {"server": "down", "operation": "x", "start_condition": {"type": "no_wait"}},
                no_wait("c"),
            ]),
        );
        orch.append_process_group(pg).await.unwrap();
        orch.start().await.unwrap();
        let status = wait_until_stopped(&orch).await;
        assert_eq!(status.loop_state, LoopState::Stopped);
        assert_eq!(transport.count(), 1);
        // The third action is still pending; nothing was re-queued.
        assert_eq!(status.queued_actions, 1);
    }

    #[tokio::test]
    async fn skip_moves_to_next_group() {
        let transport = Arc::new(FakeTransport::default());
        let orch = spawn(transport.clone());
        let blocker = Uuid::new_v4();
        orch.push_status(running("motion", "move", &[(blocker, InstanceState::Running)]));
        orch.wait_for_revision(1).await;

        let first = ProcessGroup::new("sequence", "first").with_plan_param(
            "actions",
            json!([no_wait("a"), {"server": "sim", "operation": "blocked"}, no_wait("never")]),
        );
        let second = ProcessGroup::new("sequence", "second")
            .with_plan_param("actions", json!([no_wait("z")]));
        orch.append_process_group(first).await.unwrap();
        orch.append_process_group(second).await.unwrap();
        orch.start().await.unwrap();

        // "blocked" waits for all; skip takes effect once it dispatches.
        wait_until_in_flight(&orch, 1.0).await;
        orch.skip().await.unwrap();
        orch.push_status(running("motion", "move", &[]));
        wait_until_stopped(&orch).await;

        let ops: Vec<String> = transport
            .dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.operation.clone())
            .collect();
        assert_eq!(ops, vec!["a", "blocked", "z"]);
        let last = orch.last_process_group().await.unwrap().unwrap();
        assert_eq!(last.label, "second");
    }

    #[tokio::test]
    async fn stop_waits_for_idle() {
        let transport = Arc::new(FakeTransport::default());
        let orch = spawn(transport.clone());
        let pg = ProcessGroup::new("sequence", "x").with_plan_param(
            "actions",
            json!([
                {"server": "sim", "operation": "a", "start_condition": {"type": "wait_for_endpoint"}},
                no_wait("b"),
            ]),
        );
        orch.append_process_group(pg).await.unwrap();
        let busy = Uuid::new_v4();
        orch.push_status(running("sim", "a", &[(busy, InstanceState::Running)]));
        orch.wait_for_revision(1).await;

        // Ignored while stopped.
        assert_eq!(orch.stop().await.unwrap(), LoopIntent::None);

        orch.start().await.unwrap();
        assert_eq!(orch.stop().await.unwrap(), LoopIntent::Stop);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(orch.status().await.unwrap().loop_state, LoopState::Started);

        orch.push_status(running("sim", "a", &[]));
        let status = wait_until_stopped(&orch).await;
        assert_eq!(status.intent, LoopIntent::None);
        // The in-flight action completed; the next one was never taken.
        assert_eq!(transport.count(), 1);
        assert_eq!(status.queued_actions, 1);
    }

    #[tokio::test]
    async fn start_with_empty_queues_stays_stopped() {
        let orch = spawn(Arc::new(FakeTransport::default()));
        assert_eq!(orch.start().await.unwrap(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn unknown_plan_is_rejected_at_append() {
        let orch = spawn(Arc::new(FakeTransport::default()));
        let err = orch
            .append_process_group(ProcessGroup::new("nope", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchError::UnknownPlan(_)));
        assert!(orch.list_process_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn appended_actions_are_numbered_in_order() {
        let orch = spawn(Arc::new(FakeTransport::default()));
        let a = orch.add_action(Action::new("sim", "a"), Position::Back).await.unwrap();
        let b = orch.add_action(Action::new("sim", "b"), Position::Back).await.unwrap();
        assert_eq!(a, SequenceNumber::from(0.0));
        assert_eq!(b, SequenceNumber::from(1.0));

        let seqs = orch
            .supplement_actions(a, vec![Action::new("sim", "fix")])
            .await
            .unwrap();
        assert_eq!(seqs, vec![SequenceNumber::from(0.01)]);
        let ops: Vec<String> = orch
            .list_actions()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.operation)
            .collect();
        assert_eq!(ops, vec!["a", "fix", "b"]);

        orch.remove_action(SequenceNumber::from(0.01)).await.unwrap();
        assert_eq!(orch.clear_actions().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_handle() {
        let orch = spawn(Arc::new(FakeTransport::default()));
        orch.shutdown();
        for _ in 0..100 {
            if orch.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(orch.status().await, Err(OrchError::Closed)));
    }
}
