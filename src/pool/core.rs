//! Pool lifecycle
//!
//! Spawns the fixed executor set over one bounded queue and joins them at
//! shutdown within the grace period.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::budget::BudgetGovernor;
use crate::checkpoint::CheckpointStore;
use crate::events::EventSink;
use crate::store::TaskStore;
use crate::tool::ToolClient;

use super::breaker::CircuitBreaker;
use super::executor::Executor;
use super::{Dispatch, ExecReport};

/// Pool sizing and per-invocation limits
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of executors (1..=32)
    pub max_workers: usize,
    /// Per-invocation wall clock
    pub worker_timeout: Duration,
    /// Working directory handed to the tool
    pub workdir: PathBuf,
    /// Breaker tuning
    pub failure_threshold: u32,
    pub open_cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            worker_timeout: Duration::from_secs(1800),
            workdir: PathBuf::from("."),
            failure_threshold: 5,
            open_cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(600),
        }
    }
}

/// Handle to a running pool
pub struct ExecutorPool {
    dispatch_tx: mpsc::Sender<Dispatch>,
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ExecutorPool {
    /// Spawn `max_workers` executors over a bounded queue of capacity
    /// `2 × max_workers`. Returns the pool handle and the report stream.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: PoolConfig,
        store: TaskStore,
        checkpoints: Arc<CheckpointStore>,
        budget: Arc<BudgetGovernor>,
        tool: Arc<dyn ToolClient>,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<ExecReport>) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<Dispatch>(config.max_workers * 2);
        let (report_tx, report_rx) = mpsc::channel::<ExecReport>(1024);
        let queue = Arc::new(Mutex::new(dispatch_rx));

        let mut handles = Vec::with_capacity(config.max_workers);
        for id in 1..=config.max_workers {
            let executor = Executor {
                id,
                store: store.clone(),
                checkpoints: checkpoints.clone(),
                budget: budget.clone(),
                tool: tool.clone(),
                events: events.clone(),
                breaker: CircuitBreaker::new(config.failure_threshold, config.open_cooldown, config.max_cooldown),
                worker_timeout: config.worker_timeout,
                workdir: config.workdir.clone(),
                queue: queue.clone(),
                reports: report_tx.clone(),
                cancel: cancel.child_token(),
            };
            handles.push(tokio::spawn(executor.run()));
        }

        info!(workers = config.max_workers, "executor pool started");
        (
            Self {
                dispatch_tx,
                handles,
                cancel,
            },
            report_rx,
        )
    }

    /// Submit a task for execution. Blocks while the queue is full; this is
    /// the planner's backpressure signal.
    pub async fn submit(&self, task_id: &str) -> eyre::Result<()> {
        self.dispatch_tx
            .send(Dispatch {
                task_id: task_id.to_string(),
            })
            .await
            .map_err(|_| eyre::eyre!("Executor pool queue closed"))
    }

    /// Stop feeding the pool and join every executor, force-aborting any
    /// straggler once the grace period runs out.
    pub async fn shutdown(self, grace: Duration) {
        debug!("pool shutdown: closing queue");
        drop(self.dispatch_tx);
        self.cancel.cancel();

        let joined = futures::future::join_all(self.handles);
        if tokio::time::timeout(grace, joined).await.is_err() {
            warn!("executors did not stop within the grace period");
        }
        info!("executor pool stopped");
    }
}
