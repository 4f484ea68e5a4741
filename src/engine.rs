//! Engine - composition root
//!
//! Opens the stores, reloads budget state, runs the resume protocol, wires
//! the planner to the pool, and drives the shutdown sequence within the
//! grace period.

use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::budget::BudgetGovernor;
use crate::checkpoint::{CheckpointStore, resume};
use crate::config::Config;
use crate::events::{EngineEvent, EventSink};
use crate::planner::{Planner, RunOutcome};
use crate::pool::ExecutorPool;
use crate::progress::ProgressSink;
use crate::store::TaskStore;
use crate::tool::ToolClient;

/// Result of a full engine run
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Final state of every task, for the terminal summary
    pub tasks: Vec<crate::domain::Task>,
    pub tokens_used: u64,
}

/// The orchestration engine
pub struct Engine {
    config: Config,
    tool: Arc<dyn ToolClient>,
    events: Arc<dyn EventSink>,
    progress: Arc<dyn ProgressSink>,
}

impl Engine {
    pub fn new(
        config: Config,
        tool: Arc<dyn ToolClient>,
        events: Arc<dyn EventSink>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            config,
            tool,
            events,
            progress,
        }
    }

    /// Run to completion or cancellation.
    ///
    /// `cancel` is the root of the cancellation tree: cancelling it stops
    /// queue submission, signals every in-flight invocation, and starts the
    /// shutdown sequence.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport> {
        self.config.validate().context("configuration invalid")?;

        // A corrupted store file aborts startup here, before anything runs
        let store = TaskStore::open(&self.config.store.dir, self.progress.clone())?;
        let budget = Arc::new(BudgetGovernor::with_snapshot(
            self.config.budget.clone(),
            self.config.store.dir.join("budget.json"),
        ));
        let checkpoints = Arc::new(
            CheckpointStore::open(&self.config.checkpoint.root).map_err(|e| eyre::eyre!("checkpoint store: {}", e))?,
        );

        match checkpoints.gc(self.config.checkpoint_max_age_ms()) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "collected expired checkpoints"),
            Err(e) => warn!(error = %e, "checkpoint gc failed"),
        }

        // No task is left running after this
        let resumed = resume(&store, &checkpoints, self.config.stale_threshold_ms(), &self.events).await?;
        if resumed.restored > 0 || resumed.stale > 0 {
            info!(%resumed, "resume protocol applied");
        }

        let (pool, reports) = ExecutorPool::spawn(
            self.config.pool_config(),
            store.clone(),
            checkpoints.clone(),
            budget.clone(),
            self.tool.clone(),
            self.events.clone(),
            cancel.child_token(),
        );

        let planner = Planner::new(
            self.config.planner_config(),
            store.clone(),
            pool,
            reports,
            budget.clone(),
            self.tool.clone(),
            self.events.clone(),
            cancel.clone(),
        );

        let (outcome, pool) = planner.run().await?;

        // Shutdown: stop submissions, signal executors, flush state
        pool.shutdown(Duration::from_secs(self.config.shutdown_grace_secs)).await;

        if let Err(e) = store.flush().await {
            warn!(error = %e, "final store flush failed");
        }
        if let Err(e) = budget.persist().await {
            warn!(error = %e, "budget snapshot persist failed");
        }

        self.events.emit(&EngineEvent::Shutdown {
            outcome: outcome.as_str().to_string(),
        });

        let tasks = store.list_all().await.map_err(|e| eyre::eyre!("{}", e))?;
        let tokens_used = budget.tokens_used().await;
        store.shutdown().await.map_err(|e| eyre::eyre!("{}", e))?;

        info!(outcome = outcome.as_str(), tokens_used, "engine run finished");
        Ok(RunReport {
            outcome,
            tasks,
            tokens_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Task, TaskStatus};
    use crate::events::NullSink;
    use crate::progress::NullProgress;
    use crate::tool::ScriptedTool;
    use tempfile::tempdir;

    fn test_config(root: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.store.dir = root.join("store");
        config.checkpoint.root = root.join("checkpoints");
        config.tool.workdir = root.to_path_buf();
        config.worker_timeout_secs = 5;
        config.shutdown_grace_secs = 5;
        config.review_depth = 0;
        config.retry.base_delay_secs = 1;
        config
    }

    fn engine_with(config: Config, tool: Arc<ScriptedTool>) -> Engine {
        Engine::new(config, tool, Arc::new(NullSink), Arc::new(NullProgress))
    }

    async fn seed_task(dir: &std::path::Path, task: Task) {
        let store = TaskStore::open(dir, Arc::new(NullProgress)).unwrap();
        store.insert(task).await.unwrap();
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_engine_completes_single_task() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path());
        seed_task(&config.store.dir, Task::new("t-1", "only", "task")).await;

        let tool = Arc::new(ScriptedTool::new());
        tool.script_success("t-1", 100);

        let report = engine_with(config, tool).run(CancellationToken::new()).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.tokens_used, 100);
        assert_eq!(report.tasks.len(), 1);
        assert_eq!(report.tasks[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_engine_rejects_invalid_config() {
        let temp = tempdir().unwrap();
        let mut config = test_config(temp.path());
        config.max_workers = 0;

        let result = engine_with(config, Arc::new(ScriptedTool::new()))
            .run(CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_engine_empty_store_completes() {
        let temp = tempdir().unwrap();
        let config = test_config(temp.path());

        let report = engine_with(config, Arc::new(ScriptedTool::new()))
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(report.tasks.is_empty());
    }
}
