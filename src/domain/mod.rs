//! Domain types for taskpilot
//!
//! Core domain types: Task, Checkpoint, Priority, and the error taxonomy.
//! Everything here is plain data with serde support; services own behavior.

mod checkpoint;
mod error;
mod priority;
mod task;

pub use checkpoint::{Checkpoint, CheckpointState};
pub use error::{ErrorKind, TaskError};
pub use priority::Priority;
pub use task::{Task, TaskFilter, TaskOutcome, TaskStatus};

/// Current Unix time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
