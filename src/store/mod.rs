//! Task store
//!
//! A single-writer actor owning the task index, with write-through
//! persistence to one human-readable JSON file. All planner and executor
//! mutations go through the cloneable [`TaskStore`] handle.

mod manager;
mod messages;
mod persist;

pub use manager::TaskStore;
pub use messages::{StoreCommand, StoreError, StoreResponse, TaskMutator};
