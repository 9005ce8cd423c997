//! Status synchronization: the table, its single-consumer tracker and the
//! push message format.

pub mod table;
pub mod tracker;

pub use table::{
    Classification, DeltaReport, GlobalState, InstanceState, LiveInstance, OperationReport,
    OperationStatus, StatusDelta, StatusMessage, StatusTable,
};
pub use tracker::{EstopSignal, StatusTracker, StatusUpdate, TableSnapshot};
