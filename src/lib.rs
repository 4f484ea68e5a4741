//! TaskPilot - parallel LLM task orchestration
//!
//! TaskPilot drives an external LLM command-line tool to complete
//! software-engineering tasks in parallel. A single planner resolves
//! dependencies over a persistent task store and feeds ready tasks into a
//! bounded pool of executors; every external invocation is wrapped in retry
//! backoff and a per-executor circuit breaker, snapshotted through the
//! checkpoint store, and admitted by the token-budget governor.
//!
//! # Core Concepts
//!
//! - **Deterministic dispatch**: the topological order with stable
//!   tie-breaks is the single source of truth for dispatch order
//! - **State in files**: the task store, checkpoints, and budget snapshot
//!   all persist as human-readable files and survive restarts
//! - **Scoped invocations**: every tool subprocess is bounded by a wall
//!   clock and the cancellation tree; no orphans
//! - **Isolated failure**: a misbehaving executor trips its own breaker
//!   while the rest of the pool keeps draining the queue
//!
//! # Modules
//!
//! - [`domain`] - task, checkpoint, priority, and error-kind types
//! - [`store`] - single-writer task store with write-through persistence
//! - [`planner`] - frontier computation, ordering, dispatch, review pass
//! - [`pool`] - bounded executor pool and per-executor circuit breakers
//! - [`checkpoint`] - per-step snapshots and the crash-resume protocol
//! - [`budget`] - token-budget admission and accounting
//! - [`tool`] - the external tool port and its subprocess implementation

pub mod budget;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod events;
pub mod planner;
pub mod pool;
pub mod progress;
pub mod retry;
pub mod store;
pub mod tool;

// Re-export commonly used types
pub use budget::{Admission, BudgetConfig, BudgetGovernor, EnforcementMode};
pub use checkpoint::{CheckpointError, CheckpointStore, ResumeStats, resume};
pub use config::Config;
pub use domain::{Checkpoint, CheckpointState, ErrorKind, Priority, Task, TaskError, TaskStatus};
pub use engine::{Engine, RunReport};
pub use events::{CaptureSink, EngineEvent, EventSink, LogSink, NullSink};
pub use planner::{Planner, PlannerConfig, RunOutcome, detect_cycles, topological_order};
pub use pool::{CircuitBreaker, ExecutorPool, PoolConfig};
pub use progress::{LogProgress, NullProgress, ProgressSink, render_summary};
pub use retry::RetryPolicy;
pub use store::{StoreError, TaskStore};
pub use tool::{CliTool, ScriptedTool, ToolClient, ToolError, ToolOutput, ToolRequest};
