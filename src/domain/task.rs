//! Task domain type
//!
//! The unit of work. Tasks are created externally (or by the review pass),
//! mutated only through the store's transactional API, and never deleted by
//! the engine.

use serde::{Deserialize, Serialize};

use super::error::TaskError;
use super::now_ms;
use super::priority::Priority;

/// Task status
///
/// Unknown values in the store file are a deserialization error, never
/// coerced to a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies
    #[default]
    Pending,
    /// All dependencies completed; eligible for dispatch
    Ready,
    /// Held by exactly one executor
    Running,
    /// Result stored
    Completed,
    /// Retries exhausted or permanent error
    Failed,
    /// A dependency failed permanently
    Blocked,
}

impl TaskStatus {
    /// Whether the permitted-transition set allows `from -> to`.
    ///
    /// Identity transitions are permitted no-ops. `Running -> Ready` is the
    /// release path (lost budget admission, breaker open, cancellation).
    /// `Pending -> Failed` covers dependency-cycle members, which fail
    /// before ever becoming ready.
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if from == to {
            return true;
        }
        matches!(
            (from, to),
            (Pending, Ready)
                | (Pending, Failed)
                | (Ready, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Ready)
                | (Failed, Ready)
                | (_, Blocked)
        )
    }

    /// Terminal states are never re-dispatched
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// Result payload stored on a completed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskOutcome {
    /// Free-form explanatory text from the tool
    pub text: String,
    /// Paths the tool claims to have created (validated on disk)
    #[serde(default)]
    pub created_files: Vec<String>,
    /// Paths the tool claims to have modified (validated on disk)
    #[serde(default)]
    pub modified_files: Vec<String>,
    /// Tokens the tool reported for this invocation
    #[serde(default)]
    pub tokens_used: u64,
}

/// A unit of work in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Opaque identifier, stable across runs
    pub id: String,

    /// Short title for display
    pub title: String,

    /// Free text used as prompt material
    pub description: String,

    /// Current status
    #[serde(default)]
    pub status: TaskStatus,

    /// Scheduling priority
    #[serde(default)]
    pub priority: Priority,

    /// Forward dependency edges (task ids that must complete first)
    #[serde(default)]
    pub deps: Vec<String>,

    /// Number of dispatch attempts so far
    #[serde(default)]
    pub attempts: u32,

    /// Last failure, if any
    #[serde(default)]
    pub last_error: Option<TaskError>,

    /// Result of the successful attempt, if any
    #[serde(default)]
    pub result: Option<TaskOutcome>,

    /// Carry-over context for the next attempt (previous error summary,
    /// restored-from-checkpoint marker)
    #[serde(default)]
    pub retry_context: Option<String>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds); doubles as the
    /// optimistic-concurrency version for store writes
    pub updated_at: i64,
}

impl Task {
    /// Create a new pending task
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            priority: Priority::Medium,
            deps: Vec::new(),
            attempts: 0,
            last_error: None,
            result: None,
            retry_context: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder method to set priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to add a dependency
    pub fn with_dep(mut self, dep: impl Into<String>) -> Self {
        self.deps.push(dep.into());
        self
    }

    /// Builder method to pin the creation timestamp (ordering tests)
    pub fn with_created_at(mut self, ts: i64) -> Self {
        self.created_at = ts;
        self.updated_at = ts;
        self
    }

    /// Update the status
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    /// Record a failure
    pub fn set_error(&mut self, error: TaskError) {
        self.last_error = Some(error);
        self.updated_at = now_ms();
    }

    /// Store the successful result
    pub fn set_result(&mut self, result: TaskOutcome) {
        self.result = Some(result);
        self.updated_at = now_ms();
    }

    /// Set the carry-over context for the next attempt
    pub fn set_retry_context(&mut self, context: impl Into<String>) {
        self.retry_context = Some(context.into());
        self.updated_at = now_ms();
    }

    /// Count one dispatch attempt
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
        self.updated_at = now_ms();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Filter for store list operations
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            priority: None,
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status
            && task.status != status
        {
            return false;
        }
        if let Some(priority) = self.priority
            && task.priority != priority
        {
            return false;
        }
        true
    }
}
