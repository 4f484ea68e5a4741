//! Checkpoint store and crash resume
//!
//! Durable per-step snapshots under a root directory partitioned by state,
//! plus the startup protocol that resolves interrupted tasks.

mod resume;
mod store;

pub use resume::{RESTORED_MARKER, ResumeStats, resume};
pub use store::{CheckpointError, CheckpointFilter, CheckpointStore};
