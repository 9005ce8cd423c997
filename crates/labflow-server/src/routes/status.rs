use axum::extract::State;
use axum::Json;
use labflow_core::orchestrator::OrchestratorStatus;
use labflow_core::status::{LiveInstance, StatusMessage, TableSnapshot};

use crate::error::AppError;
use crate::state::OrchState;

/// GET /api/status
pub async fn status(State(app): State<OrchState>) -> Result<Json<OrchestratorStatus>, AppError> {
    Ok(Json(app.orch.status().await?))
}

/// GET /api/active_actions: every id some server still reports running.
pub async fn active_actions(State(app): State<OrchState>) -> Json<Vec<LiveInstance>> {
    Json(app.orch.active_actions())
}

/// GET /api/table
pub async fn table(State(app): State<OrchState>) -> Json<TableSnapshot> {
    Json(app.orch.table())
}

/// POST /update_status: status push from an action server. Always acknowledged.
pub async fn update_status(
    State(app): State<OrchState>,
    Json(msg): Json<StatusMessage>,
) -> Json<bool> {
    tracing::debug!(server = %msg.server, "status update received");
    app.orch.push_status(msg);
    Json(true)
}
