use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::error::AppError;
use crate::state::OrchState;

/// POST /api/start: begin dispatching. Stays stopped when both queues are empty.
pub async fn start(State(app): State<OrchState>) -> Result<Json<serde_json::Value>, AppError> {
    let state = app.orch.start().await?;
    Ok(Json(json!({ "loop_state": state })))
}

/// POST /api/stop: finish the in-flight action, then stop once servers are idle.
pub async fn stop(State(app): State<OrchState>) -> Result<Json<serde_json::Value>, AppError> {
    let intent = app.orch.stop().await?;
    Ok(Json(json!({ "intent": intent })))
}

/// POST /api/skip: drop the rest of the active process group.
pub async fn skip(State(app): State<OrchState>) -> Result<Json<serde_json::Value>, AppError> {
    let intent = app.orch.skip().await?;
    Ok(Json(json!({ "intent": intent })))
}

/// POST /api/estop: force-stop every busy server.
pub async fn estop(State(app): State<OrchState>) -> Result<Json<serde_json::Value>, AppError> {
    app.orch.estop().await?;
    let status = app.orch.status().await?;
    Ok(Json(json!({ "loop_state": status.loop_state })))
}

/// POST /api/clear_estop: release estopped servers and their ids.
pub async fn clear_estop(
    State(app): State<OrchState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let state = app.orch.clear_estate(true, false).await?;
    Ok(Json(json!({ "loop_state": state })))
}

/// POST /api/clear_error: drop errored ids on every server.
pub async fn clear_error(
    State(app): State<OrchState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let state = app.orch.clear_estate(false, true).await?;
    Ok(Json(json!({ "loop_state": state })))
}
