//! Task model and the finite state machine vocabulary shared by every stage.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Attempts at which a still-failing task becomes CRITICAL_ERROR.
pub const MAX_ATTEMPTS: i32 = 10;

/// Seconds of backoff per attempt after a failure (linear).
pub const BACKOFF_STEP_SECS: i64 = 5;

/// Payload/result/error maps are flat string-to-string mappings. BTreeMap
/// keeps serialization deterministic.
pub type KvMap = BTreeMap<String, String>;

/// State of a task inside the store's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Scheduled,
    Acquired,
    Success,
    Error,
    CriticalError,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Acquired => "ACQUIRED",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::CriticalError => "CRITICAL_ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(Self::Scheduled),
            "ACQUIRED" => Some(Self::Acquired),
            "SUCCESS" => Some(Self::Success),
            "ERROR" => Some(Self::Error),
            "CRITICAL_ERROR" => Some(Self::CriticalError),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of operations a worker knows how to execute. Unknown method
/// strings are rejected when the envelope is decoded, not at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskAction {
    Dummy,
    Export,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dummy => "DUMMY",
            Self::Export => "EXPORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DUMMY" => Some(Self::Dummy),
            "EXPORT" => Some(Self::Export),
            _ => None,
        }
    }

    /// Map a submission method (`submit:<action>`) to its action.
    pub fn parse_submit_method(method: &str) -> Option<Self> {
        match method {
            "submit:dummy" => Some(Self::Dummy),
            "submit:export" => Some(Self::Export),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schedulable unit of work tracked through the store.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub action: TaskAction,
    pub payload: KvMap,
    pub state: TaskState,
    pub attempts: i32,
    pub result: KvMap,
    pub error: KvMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set only in ERROR: the task is not re-eligible until this elapses.
    pub delayed_until: Option<DateTime<Utc>>,
}

/// Outcome reported back to the store for one attempt of one task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success(KvMap),
    Failure(KvMap),
}

impl TaskOutcome {
    /// The attempt number threaded through the result/error map, if present
    /// and well-formed.
    pub fn attempt(&self) -> Option<i32> {
        let map = match self {
            Self::Success(map) => map,
            Self::Failure(map) => map,
        };
        map.get("attempt").and_then(|v| v.parse().ok())
    }
}
