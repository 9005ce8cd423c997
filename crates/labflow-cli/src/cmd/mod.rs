pub mod config;
pub mod ctl;
pub mod orchestrator;
pub mod server;
