use std::time::Duration;

use thiserror::Error;

/// Failure to deliver a request to an action server or to read its response.
///
/// The caller cannot know whether the remote side effect happened, so these
/// are never retried by the dispatcher.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no address configured for action server '{0}'")]
    UnknownServer(String),

    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("{url} returned HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

#[derive(Debug, Error)]
pub enum OrchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown plan generator: {0}")]
    UnknownPlan(String),

    #[error("unknown operation '{operation}' on server '{server}'")]
    UnknownOperation { server: String, operation: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("process group not found: {0}")]
    ProcessGroupNotFound(String),

    #[error("action not found: {0}")]
    ActionNotFound(String),

    #[error("start condition not met within {0:?}")]
    StartConditionTimeout(Duration),

    #[error("orchestrator is no longer running")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OrchError>;
