use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use labflow_core::error::{OrchError, TransportError};

// ---------------------------------------------------------------------------
// AppError — unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(OrchError::Validation(msg.into()).into())
    }
}

fn status_for(e: &OrchError) -> StatusCode {
    match e {
        OrchError::ProcessGroupNotFound(_)
        | OrchError::ActionNotFound(_)
        | OrchError::UnknownOperation { .. } => StatusCode::NOT_FOUND,
        OrchError::Validation(_) | OrchError::UnknownPlan(_) => StatusCode::BAD_REQUEST,
        OrchError::InvalidState(_) => StatusCode::CONFLICT,
        OrchError::Transport(TransportError::UnknownServer(_)) => StatusCode::NOT_FOUND,
        OrchError::Transport(_) => StatusCode::BAD_GATEWAY,
        OrchError::StartConditionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        OrchError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        OrchError::Io(_) | OrchError::Yaml(_) | OrchError::Json(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self
            .0
            .downcast_ref::<OrchError>()
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({ "error": format!("{:#}", self.0) });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(e: OrchError) -> StatusCode {
        AppError(e.into()).into_response().status()
    }

    #[test]
    fn not_found_variants_map_to_404() {
        assert_eq!(status_of(OrchError::ActionNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(OrchError::ProcessGroupNotFound("index 3".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(OrchError::UnknownOperation {
                server: "pstat".into(),
                operation: "x".into()
            }),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn invalid_state_maps_to_409() {
        assert_eq!(status_of(OrchError::InvalidState("estop".into())), StatusCode::CONFLICT);
    }

    #[test]
    fn validation_maps_to_400() {
        assert_eq!(status_of(OrchError::Validation("bad".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(OrchError::UnknownPlan("p".into())), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn transport_maps_to_502() {
        let e = OrchError::Transport(TransportError::Request {
            url: "http://x".into(),
            message: "refused".into(),
        });
        assert_eq!(status_of(e), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn non_orch_error_maps_to_500() {
        let err = AppError(anyhow::anyhow!("something unexpected"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
