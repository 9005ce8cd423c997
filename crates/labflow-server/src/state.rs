use labflow_core::action_server::ActionServer;
use labflow_core::config::LabConfig;
use labflow_core::orchestrator::Orchestrator;
use std::sync::Arc;

/// Shared state of the orchestrator's HTTP surface.
#[derive(Clone)]
pub struct OrchState {
    pub orch: Orchestrator,
    pub config: Arc<LabConfig>,
}

impl OrchState {
    pub fn new(orch: Orchestrator, config: LabConfig) -> Self {
        Self {
            orch,
            config: Arc::new(config),
        }
    }
}

/// Shared state of one action server's HTTP surface.
#[derive(Clone)]
pub struct ServerState {
    pub server: Arc<ActionServer>,
}

impl ServerState {
    pub fn new(server: ActionServer) -> Self {
        Self {
            server: Arc::new(server),
        }
    }
}
