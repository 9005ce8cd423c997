pub mod action;
pub mod control;
pub mod events;
pub mod queue;
pub mod status;
