//! Records exchanged between the orchestrator and action servers.

pub mod action;
pub mod process_group;
pub mod sample;

pub use action::{
    Action, ActionError, Endpoint, ErrorCode, ProcessGroupRef, SequenceNumber, StartCondition,
};
pub use process_group::ProcessGroup;
pub use sample::{Sample, SampleInheritance, SampleIo, SampleStatus, SampleType};
