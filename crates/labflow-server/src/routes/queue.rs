use axum::extract::{Path, State};
use axum::Json;
use labflow_core::model::{Action, ProcessGroup, SequenceNumber};
use labflow_core::orchestrator::Position;
use labflow_core::OrchError;
use serde::Deserialize;
use serde_json::json;

use crate::error::AppError;
use crate::state::OrchState;

fn back() -> Position {
    Position::Back
}

#[derive(Debug, Deserialize)]
pub struct AddGroupBody {
    pub group: ProcessGroup,
    #[serde(default = "back")]
    pub position: Position,
}

#[derive(Debug, Deserialize)]
pub struct AddActionBody {
    pub action: Action,
    #[serde(default = "back")]
    pub position: Position,
}

#[derive(Debug, Deserialize)]
pub struct SupplementBody {
    pub after: SequenceNumber,
    pub actions: Vec<Action>,
}

// ---------------------------------------------------------------------------
// Process groups
// ---------------------------------------------------------------------------

/// GET /api/process_groups
pub async fn list_groups(State(app): State<OrchState>) -> Result<Json<Vec<ProcessGroup>>, AppError> {
    Ok(Json(app.orch.list_process_groups().await?))
}

/// POST /api/process_groups: queue a group, at the back unless told otherwise.
pub async fn add_group(
    State(app): State<OrchState>,
    Json(body): Json<AddGroupBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    app.orch.add_process_group(body.group, body.position).await?;
    let queued = app.orch.list_process_groups().await?.len();
    Ok(Json(json!({ "queued": queued })))
}

/// DELETE /api/process_groups
pub async fn clear_groups(
    State(app): State<OrchState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = app.orch.clear_process_groups().await?;
    Ok(Json(json!({ "removed": removed })))
}

/// DELETE /api/process_groups/{index}
pub async fn remove_group(
    State(app): State<OrchState>,
    Path(index): Path<usize>,
) -> Result<Json<ProcessGroup>, AppError> {
    Ok(Json(app.orch.remove_process_group(index).await?))
}

/// GET /api/process_groups/active
pub async fn active_group(
    State(app): State<OrchState>,
) -> Result<Json<Option<ProcessGroup>>, AppError> {
    Ok(Json(app.orch.active_process_group().await?))
}

/// GET /api/process_groups/last
pub async fn last_group(
    State(app): State<OrchState>,
) -> Result<Json<Option<ProcessGroup>>, AppError> {
    Ok(Json(app.orch.last_process_group().await?))
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// GET /api/actions: actions of the active group not yet dispatched.
pub async fn list_actions(State(app): State<OrchState>) -> Result<Json<Vec<Action>>, AppError> {
    Ok(Json(app.orch.list_actions().await?))
}

/// POST /api/actions
pub async fn add_action(
    State(app): State<OrchState>,
    Json(body): Json<AddActionBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let sequence = app.orch.add_action(body.action, body.position).await?;
    Ok(Json(json!({ "sequence": sequence })))
}

/// POST /api/actions/supplement: insert actions right after `after`.
pub async fn supplement(
    State(app): State<OrchState>,
    Json(body): Json<SupplementBody>,
) -> Result<Json<Vec<SequenceNumber>>, AppError> {
    Ok(Json(app.orch.supplement_actions(body.after, body.actions).await?))
}

/// DELETE /api/actions
pub async fn clear_actions(
    State(app): State<OrchState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = app.orch.clear_actions().await?;
    Ok(Json(json!({ "removed": removed })))
}

/// DELETE /api/actions/{sequence}
pub async fn remove_action(
    State(app): State<OrchState>,
    Path(sequence): Path<String>,
) -> Result<Json<Action>, AppError> {
    let sequence: SequenceNumber = sequence
        .parse()
        .map_err(|_| OrchError::Validation(format!("'{sequence}' is not a sequence number")))?;
    Ok(Json(app.orch.remove_action(sequence).await?))
}
