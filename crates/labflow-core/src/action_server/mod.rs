//! # Action server runtime
//!
//! An [`ActionServer`] owns one instrument's operations. `dispatch` builds an
//! [`Active`] container, registers its id as running, spawns the handler and
//! returns the amended action right away; the handler's completion is only
//! visible through the status registry.
//!
//! ## Control
//!
//! | call             | effect                                                    |
//! |------------------|-----------------------------------------------------------|
//! | `force_stop`     | cancel every handler, tag running ids estopped            |
//! | `release_estop`  | drop estopped ids, accept dispatches again                |
//! | `clear_error`    | drop errored ids                                          |
//! | `attach`         | push every status message to a subscriber URL from now on |

pub mod push;
pub mod status;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::active::{Active, StreamSpec};
use crate::config::LabConfig;
use crate::error::{OrchError, Result};
use crate::model::{Action, ActionError, ErrorCode, Sample, SampleType};
use crate::status::{InstanceState, StatusMessage};

pub use push::{PushPolicy, StatusPusher};
pub use status::ServerStatus;

/// One operation's driver.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Data streams to open for `action`.
    fn streams(&self, _action: &Action) -> Vec<StreamSpec> {
        Vec::new()
    }

    /// Runs before `dispatch` returns. An error is reported back on the
    /// dispatch response and the handler body never runs.
    async fn prepare(&self, _active: &mut Active) -> std::result::Result<(), ActionError> {
        Ok(())
    }

    /// The action body. Runs in its own task after `dispatch` has returned.
    async fn run(&self, active: &mut Active) -> std::result::Result<(), ActionError>;
}

/// Server-wide facts every container of this server shares.
#[derive(Debug)]
pub struct ServerContext {
    pub name: String,
    pub machine: String,
    pub access: String,
    pub data_root: PathBuf,
    pub finish_grace: Duration,
    pub status: ServerStatus,
    sample_counter: tokio::sync::Mutex<u64>,
}

impl ServerContext {
    pub fn new(
        name: &str,
        machine: &str,
        access: &str,
        data_root: PathBuf,
        finish_grace: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            machine: machine.to_string(),
            access: access.to_string(),
            data_root,
            finish_grace,
            status: ServerStatus::new(name),
            sample_counter: tokio::sync::Mutex::new(0),
        }
    }

    pub fn from_config(name: &str, config: &LabConfig) -> Self {
        Self::new(
            name,
            &config.machine,
            &config.access,
            config.data_root.clone(),
            config.finish_grace(),
        )
    }

    /// Number a new sample. Read, increment and write happen under one lock.
    pub async fn new_sample(&self, sample_type: SampleType) -> Sample {
        let mut counter = self.sample_counter.lock().await;
        *counter += 1;
        Sample::new(sample_type, &self.machine, *counter)
    }
}

pub struct ActionServer {
    ctx: Arc<ServerContext>,
    handlers: BTreeMap<String, Arc<dyn ActionHandler>>,
    /// Stop signal per spawned handler.
    running: Arc<Mutex<HashMap<Uuid, oneshot::Sender<()>>>>,
    estopped: AtomicBool,
    pusher: StatusPusher,
}

impl ActionServer {
    pub fn new(ctx: ServerContext, policy: PushPolicy) -> Self {
        let pusher = StatusPusher::spawn(ctx.status.subscribe(), policy);
        Self {
            ctx: Arc::new(ctx),
            handlers: BTreeMap::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
            estopped: AtomicBool::new(false),
            pusher,
        }
    }

    pub fn register(&mut self, operation: impl Into<String>, handler: impl ActionHandler + 'static) {
        self.handlers.insert(operation.into(), Arc::new(handler));
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn operations(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn is_estopped(&self) -> bool {
        self.estopped.load(Ordering::SeqCst)
    }

    fn running(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<()>>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn running_count(&self) -> usize {
        self.running().len()
    }

    /// Accept `action`, start its handler and return the amended record.
    pub async fn dispatch(&self, action: Action) -> Result<Action> {
        if action.server != self.ctx.name {
            return Err(OrchError::Validation(format!(
                "action for '{}' sent to '{}'",
                action.server, self.ctx.name
            )));
        }
        let handler = self
            .handlers
            .get(&action.operation)
            .cloned()
            .ok_or_else(|| OrchError::UnknownOperation {
                server: self.ctx.name.clone(),
                operation: action.operation.clone(),
            })?;
        if self.is_estopped() {
            return Err(OrchError::InvalidState(format!(
                "'{}' is emergency-stopped",
                self.ctx.name
            )));
        }
        action.validate()?;

        let specs = handler.streams(&action);
        let mut active = Active::myinit(action, Arc::clone(&self.ctx), &specs)?;

        if let Err(err) = handler.prepare(&mut active).await {
            warn!(action_id = %active.id(), error = %err, "action rejected during prepare");
            return active.fail(err).await;
        }

        let response = active.action().clone();
        let id = active.id();

        // Hold the lock across spawn so the task cannot remove its entry first.
        let mut running = self.running();
        let registry = Arc::clone(&self.running);
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = handler.run(&mut active) => Some(outcome),
                _ = stop_rx => None,
            };
            let result = match outcome {
                Some(Ok(())) => active.finish().await,
                Some(Err(err)) => active.fail(err).await,
                None => active.stop().await,
            };
            if let Err(e) = result {
                error!(action_id = %id, error = %e, "could not finalize action");
            }
            registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
        });
        running.insert(id, stop_tx);
        drop(running);

        Ok(response)
    }

    /// Cancel every running handler and tag its id estopped. Each cancelled
    /// container still closes its streams and writes its record.
    pub fn force_stop(&self) -> Vec<Uuid> {
        self.estopped.store(true, Ordering::SeqCst);
        let tagged = self.ctx.status.estop_all();
        let cancelled: Vec<Uuid> = {
            let mut running = self.running();
            running
                .drain()
                .map(|(id, stop)| {
                    let _ = stop.send(());
                    id
                })
                .collect()
        };
        warn!(
            server = %self.ctx.name,
            cancelled = cancelled.len(),
            tagged = tagged.len(),
            "emergency stop engaged"
        );
        tagged
    }

    pub fn release_estop(&self) -> usize {
        self.estopped.store(false, Ordering::SeqCst);
        let n = self.ctx.status.release(InstanceState::Estopped);
        info!(server = %self.ctx.name, released = n, "emergency stop released");
        n
    }

    pub fn clear_error(&self) -> usize {
        let n = self.ctx.status.release(InstanceState::Errored);
        info!(server = %self.ctx.name, cleared = n, "errors cleared");
        n
    }

    /// Push every status message to `url`, starting with the current state.
    pub fn attach(&self, url: &str) -> bool {
        let added = self.pusher.attach(url);
        if added {
            info!(server = %self.ctx.name, url, "status subscriber attached");
        }
        self.ctx.status.publish_all();
        added
    }

    pub fn subscribers(&self) -> Vec<String> {
        self.pusher.subscribers()
    }

    pub fn status(&self) -> StatusMessage {
        self.ctx.status.snapshot()
    }
}

impl Drop for ActionServer {
    fn drop(&mut self) {
        // Dropping the stop senders cancels the handlers.
        self.running().clear();
        self.ctx.status.shutdown();
    }
}

impl std::fmt::Debug for ActionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionServer")
            .field("name", &self.ctx.name)
            .field("operations", &self.operations())
            .finish_non_exhaustive()
    }
}

/// Handler-side helper for rejecting bad parameters.
pub fn invalid_params(message: impl Into<String>) -> ActionError {
    ActionError::new(ErrorCode::InvalidParams, message)
}
