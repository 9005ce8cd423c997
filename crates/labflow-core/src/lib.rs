pub mod action_server;
pub mod active;
pub mod config;
pub mod error;
pub mod io;
pub mod model;
pub mod orchestrator;
pub mod plan;
pub mod pubsub;
pub mod status;
pub mod transport;

pub use error::{OrchError, Result, TransportError};
