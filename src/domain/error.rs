//! Error taxonomy
//!
//! Every failure a task can accumulate is tagged with an [`ErrorKind`]. The
//! kind drives the retry policy: transient kinds consume a retry, permanent
//! kinds fail immediately, terminal kinds end the run.

use serde::{Deserialize, Serialize};

/// Classification of task and engine failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network, rate-limit, timeout, or otherwise unexplained tool failure
    Transient,
    /// Malformed tool output (missing or unparseable header)
    Protocol,
    /// Tool claimed files that do not exist or are empty
    Validation,
    /// Task participates in a dependency cycle
    DependencyCycle,
    /// Store compare-and-swap lost after internal retries
    Conflict,
    /// Token budget refused further dispatches
    BudgetExhausted,
    /// Checkpoint checksum mismatch on load
    CorruptCheckpoint,
    /// Checkpoint too old (or absent) for a task found running at startup
    StaleCheckpoint,
    /// Invalid configuration
    Configuration,
    /// Run was interrupted
    Cancelled,
}

impl ErrorKind {
    /// Whether a failure of this kind may be retried at all
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Protocol | Self::Validation)
    }

    /// Maximum total attempts for this kind given the configured retry cap.
    ///
    /// Protocol errors are bounded to 2 attempts regardless of the cap.
    pub fn max_attempts(&self, max_retries: u32) -> u32 {
        match self {
            Self::Transient | Self::Validation => max_retries + 1,
            Self::Protocol => 2,
            _ => 1,
        }
    }

    /// Whether this kind should trip the executor's breaker counter.
    ///
    /// Only transient infrastructure failures count; a tool that violates
    /// the output contract is not a sign the executor slot is unhealthy.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Protocol => "protocol_error",
            Self::Validation => "validation_failure",
            Self::DependencyCycle => "dependency_cycle",
            Self::Conflict => "conflict",
            Self::BudgetExhausted => "budget_exhausted",
            Self::CorruptCheckpoint => "corrupt_checkpoint",
            Self::StaleCheckpoint => "stale_checkpoint",
            Self::Configuration => "configuration",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Structured error record persisted on a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// One-line rendering for the terminal summary
    pub fn one_line(&self) -> String {
        let first = self.message.lines().next().unwrap_or("");
        format!("{}: {}", self.kind, first)
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::Protocol.is_retryable());
        assert!(ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::DependencyCycle.is_retryable());
        assert!(!ErrorKind::Configuration.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_only_transient_counts_against_breaker() {
        assert!(ErrorKind::Transient.counts_against_breaker());
        assert!(!ErrorKind::Protocol.counts_against_breaker());
        assert!(!ErrorKind::Validation.counts_against_breaker());
        assert!(!ErrorKind::DependencyCycle.counts_against_breaker());
        assert!(!ErrorKind::Cancelled.counts_against_breaker());
    }

    #[test]
    fn test_max_attempts() {
        assert_eq!(ErrorKind::Transient.max_attempts(3), 4);
        assert_eq!(ErrorKind::Validation.max_attempts(3), 4);
        assert_eq!(ErrorKind::Protocol.max_attempts(3), 2);
        assert_eq!(ErrorKind::DependencyCycle.max_attempts(3), 1);
    }

    #[test]
    fn test_error_kind_serde() {
        let json = serde_json::to_string(&ErrorKind::StaleCheckpoint).unwrap();
        assert_eq!(json, "\"stale_checkpoint\"");

        let kind: ErrorKind = serde_json::from_str("\"dependency_cycle\"").unwrap();
        assert_eq!(kind, ErrorKind::DependencyCycle);
    }

    #[test]
    fn test_task_error_one_line() {
        let err = TaskError::new(ErrorKind::Validation, "missing file src/a.rs\nand more");
        assert_eq!(err.one_line(), "validation_failure: missing file src/a.rs");
    }
}
