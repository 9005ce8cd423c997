//! The dispatchable unit of work and its start condition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use super::sample::{self, Sample};
use crate::error::{OrchError, Result};

/// Offset given to each action supplemented after an existing sequence number.
pub const SUPPLEMENT_STEP: f64 = 0.01;

// ---------------------------------------------------------------------------
// SequenceNumber
// ---------------------------------------------------------------------------

/// Fractional position of an action within its process group.
///
/// Values are rounded to six decimals so repeated supplement arithmetic
/// compares equal where it should.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(f64);

impl SequenceNumber {
    pub fn new(value: f64) -> Self {
        Self((value * 1e6).round() / 1e6)
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// The `n`th supplement slot after this sequence number.
    pub fn supplement(self, n: usize) -> Self {
        Self::new(self.0 + SUPPLEMENT_STEP * n as f64)
    }
}

impl From<f64> for SequenceNumber {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

impl PartialEq for SequenceNumber {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SequenceNumber {}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl std::str::FromStr for SequenceNumber {
    type Err = std::num::ParseFloatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<f64>().map(Self::new)
    }
}

// ---------------------------------------------------------------------------
// StartCondition
// ---------------------------------------------------------------------------

/// A `(server, operation)` pair on which an action can wait.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub server: String,
    pub operation: String,
}

impl Endpoint {
    pub fn new(server: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server, self.operation)
    }
}

/// Predicate an action must satisfy before it is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StartCondition {
    /// Dispatch immediately.
    NoWait,
    /// Wait until the action's own `(server, operation)` has no running instance.
    WaitForEndpoint,
    /// Wait until no operation on the action's server has a running instance.
    WaitForServer,
    /// Wait until nothing anywhere is running.
    #[default]
    WaitForAll,
    /// Wait until every listed endpoint has no running instance.
    WaitFor { endpoints: BTreeSet<Endpoint> },
}

// ---------------------------------------------------------------------------
// ActionError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotAvailable,
    InvalidParams,
    Timeout,
    DeviceFault,
    Stopped,
    Critical,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::NotAvailable => "not_available",
            ErrorCode::InvalidParams => "invalid_params",
            ErrorCode::Timeout => "timeout",
            ErrorCode::DeviceFault => "device_fault",
            ErrorCode::Stopped => "stopped",
            ErrorCode::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A device or driver error declared by the action server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionError {
    pub code: ErrorCode,
    pub message: String,
}

impl ActionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ActionError {}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// Identity of the process group an action was dispatched under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessGroupRef {
    pub id: Uuid,
    pub label: String,
    pub started_at: DateTime<Utc>,
}

fn yes() -> bool {
    true
}

/// One dispatchable unit of work targeting a specific server operation.
///
/// The same record travels to the action server as the dispatch request body
/// and comes back, possibly amended, as the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Assigned at dispatch.
    #[serde(default)]
    pub id: Option<Uuid>,
    pub server: String,
    pub operation: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub sequence: SequenceNumber,
    #[serde(default)]
    pub start_condition: StartCondition,
    #[serde(default, deserialize_with = "sample::deserialize_samples")]
    pub samples_in: Vec<Sample>,
    #[serde(default, deserialize_with = "sample::deserialize_samples")]
    pub samples_out: Vec<Sample>,
    /// Write the metadata record when the action finishes.
    #[serde(default = "yes")]
    pub save_record: bool,
    /// Open data-stream files for the declared sample keys.
    #[serde(default = "yes")]
    pub save_data: bool,
    /// Process-group parameter name → action parameter name, copied in before dispatch.
    #[serde(default)]
    pub from_global_params: BTreeMap<String, String>,
    /// Keys of `process_params` copied back into the process group after dispatch.
    #[serde(default)]
    pub to_global_params: Vec<String>,
    /// Output parameters filled in by the action server.
    #[serde(default)]
    pub process_params: Map<String, Value>,
    #[serde(default)]
    pub orchestrator: Option<String>,
    #[serde(default)]
    pub process_group: Option<ProcessGroupRef>,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<ActionError>,
}

impl Action {
    pub fn new(server: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: None,
            server: server.into(),
            operation: operation.into(),
            params: Map::new(),
            sequence: SequenceNumber::default(),
            start_condition: StartCondition::default(),
            samples_in: Vec::new(),
            samples_out: Vec::new(),
            save_record: true,
            save_data: true,
            from_global_params: BTreeMap::new(),
            to_global_params: Vec::new(),
            process_params: Map::new(),
            orchestrator: None,
            process_group: None,
            queued_at: None,
            dispatched_at: None,
            output_dir: None,
            error: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_start_condition(mut self, condition: StartCondition) -> Self {
        self.start_condition = condition;
        self
    }

    pub fn with_sequence(mut self, sequence: impl Into<SequenceNumber>) -> Self {
        self.sequence = sequence.into();
        self
    }

    /// Parameter lookup with a typed default.
    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        self.params.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    pub fn param_u64(&self, key: &str, default: u64) -> u64 {
        self.params.get(key).and_then(Value::as_u64).unwrap_or(default)
    }

    /// Reject records that cannot be dispatched.
    pub fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            return Err(OrchError::Validation("action has no target server".into()));
        }
        if self.operation.trim().is_empty() {
            return Err(OrchError::Validation(format!(
                "action on '{}' has no target operation",
                self.server
            )));
        }
        for s in self.samples_in.iter().chain(&self.samples_out) {
            s.validate()?;
        }
        Ok(())
    }
}
