use axum::extract::{Path, State};
use axum::Json;
use labflow_core::model::Action;
use labflow_core::status::StatusMessage;
use labflow_core::transport::{EstopRequest, SubscribeRequest};
use serde_json::json;

use crate::error::AppError;
use crate::state::ServerState;

/// POST /action/{server}/{operation}: start an action, answer with the amended record.
pub async fn dispatch(
    State(app): State<ServerState>,
    Path((server, operation)): Path<(String, String)>,
    Json(action): Json<Action>,
) -> Result<Json<Action>, AppError> {
    if action.server != server || action.operation != operation {
        return Err(AppError::bad_request(format!(
            "body addresses {}/{} but was posted to {server}/{operation}",
            action.server, action.operation
        )));
    }
    Ok(Json(app.server.dispatch(action).await?))
}

/// POST /control/estop: engage or release the emergency stop.
pub async fn estop(State(app): State<ServerState>, Json(body): Json<EstopRequest>) -> Json<bool> {
    if body.engage {
        app.server.force_stop();
    } else {
        app.server.release_estop();
    }
    Json(true)
}

/// POST /control/clear_error
pub async fn clear_error(State(app): State<ServerState>) -> Json<bool> {
    app.server.clear_error();
    Json(true)
}

/// POST /control/subscribe: push status messages to `url` from now on.
/// Attaching a URL twice is not an error.
pub async fn subscribe(
    State(app): State<ServerState>,
    Json(body): Json<SubscribeRequest>,
) -> Result<Json<bool>, AppError> {
    if body.url.trim().is_empty() {
        return Err(AppError::bad_request("subscriber url must not be empty"));
    }
    app.server.attach(&body.url);
    Ok(Json(true))
}

/// GET /control/status
pub async fn status(State(app): State<ServerState>) -> Json<StatusMessage> {
    Json(app.server.status())
}

/// GET /control/info
pub async fn info(State(app): State<ServerState>) -> Json<serde_json::Value> {
    Json(json!({
        "server": app.server.name(),
        "operations": app.server.operations(),
        "estopped": app.server.is_estopped(),
        "running": app.server.running_count(),
        "subscribers": app.server.subscribers(),
    }))
}
