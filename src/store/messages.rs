//! Task store messages
//!
//! Commands and errors for the store actor.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{Task, TaskFilter, TaskStatus};

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Concurrent modification of {0}")]
    Conflict(String),

    #[error("Task already exists: {0}")]
    AlreadyExists(String),

    #[error("Store file corrupted: {0}")]
    Corrupt(String),

    #[error("Store I/O error: {0}")]
    Io(String),

    #[error("Store channel closed")]
    Channel,
}

/// Response from store operations
pub type StoreResponse<T> = Result<T, StoreError>;

/// Mutation applied inside a transition, after the status check passes
pub type TaskMutator = Box<dyn FnOnce(&mut Task) + Send>;

/// Commands sent to the store actor
pub enum StoreCommand {
    Get {
        id: String,
        reply: oneshot::Sender<StoreResponse<Task>>,
    },
    Insert {
        task: Task,
        reply: oneshot::Sender<StoreResponse<()>>,
    },
    Put {
        task: Task,
        /// The `updated_at` the caller read; mismatch is a conflict
        expected_updated_at: i64,
        reply: oneshot::Sender<StoreResponse<()>>,
    },
    List {
        filter: TaskFilter,
        reply: oneshot::Sender<StoreResponse<Vec<Task>>>,
    },
    Transition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
        mutator: Option<TaskMutator>,
        reply: oneshot::Sender<StoreResponse<Task>>,
    },
    BatchUpdate {
        tasks: Vec<Task>,
        reply: oneshot::Sender<StoreResponse<()>>,
    },
    Flush {
        reply: oneshot::Sender<StoreResponse<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
