//! Planner - selects, orders, and dispatches the ready frontier
//!
//! The planner is the single consumer of executor reports, so its state
//! updates are serialized in arrival order. Dispatch order is the
//! deterministic topological order; queue submission blocks when the pool
//! is saturated, which is the backpressure signal.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::budget::{Admission, BudgetGovernor};
use crate::domain::{ErrorKind, TaskError, TaskStatus};
use crate::events::{EngineEvent, EventSink};
use crate::pool::{ExecReport, ExecutorPool, ReleaseReason};
use crate::retry::RetryPolicy;
use crate::store::{StoreError, TaskStore};
use crate::tool::ToolClient;

use super::frontier;
use super::order::{detect_cycles, topological_order};
use super::review::{REVIEW_TASK_ID, ReviewOutcome, review_round};

/// Planner tuning
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub retry: RetryPolicy,
    /// Maximum review rounds after the frontier drains
    pub review_depth: u32,
    /// Wall clock for review invocations
    pub worker_timeout: Duration,
    /// Working directory for review invocations
    pub workdir: PathBuf,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            review_depth: 3,
            worker_timeout: Duration::from_secs(1800),
            workdir: PathBuf::from("."),
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every task completed
    Completed,
    /// At least one task failed or was blocked
    TasksFailed,
    /// The budget governor refused further dispatches
    BudgetExhausted,
    /// The run was cancelled
    Interrupted,
}

impl RunOutcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::TasksFailed => 2,
            Self::BudgetExhausted => 3,
            Self::Interrupted => 130,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TasksFailed => "tasks_failed",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Drives the run: frontier sweeps, dispatch, completion handling, retries,
/// and the review pass.
pub struct Planner {
    config: PlannerConfig,
    store: TaskStore,
    pool: ExecutorPool,
    reports: mpsc::Receiver<ExecReport>,
    budget: Arc<BudgetGovernor>,
    tool: Arc<dyn ToolClient>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,

    /// Tasks dispatched and not yet reported back
    in_flight: HashSet<String>,
    /// Tasks with a scheduled wakeup (retry backoff or breaker cooldown)
    waiting: HashSet<String>,
    wakeup_tx: mpsc::Sender<String>,
    wakeup_rx: mpsc::Receiver<String>,
    /// Strict-mode budget refusal latch
    budget_refused: bool,
    review_rounds: u32,
}

impl Planner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PlannerConfig,
        store: TaskStore,
        pool: ExecutorPool,
        reports: mpsc::Receiver<ExecReport>,
        budget: Arc<BudgetGovernor>,
        tool: Arc<dyn ToolClient>,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        let (wakeup_tx, wakeup_rx) = mpsc::channel(256);
        Self {
            config,
            store,
            pool,
            reports,
            budget,
            tool,
            events,
            cancel,
            in_flight: HashSet::new(),
            waiting: HashSet::new(),
            wakeup_tx,
            wakeup_rx,
            budget_refused: false,
            review_rounds: 0,
        }
    }

    /// Run to completion. Returns the outcome and hands the pool back for
    /// the shutdown sequence.
    pub async fn run(mut self) -> eyre::Result<(RunOutcome, ExecutorPool)> {
        info!("planner starting");
        self.fail_cycles().await?;

        let outcome = loop {
            let swept = frontier::sweep(&self.store, &self.waiting).await?;
            for (task_id, failed_dep) in swept.blocked {
                self.events.emit(&EngineEvent::TaskBlocked { task_id, failed_dep });
            }

            if self.cancel.is_cancelled() {
                break RunOutcome::Interrupted;
            }

            if !self.budget_refused {
                self.dispatch_ready().await?;
            }

            if self.in_flight.is_empty() && self.waiting.is_empty() {
                if self.budget_refused {
                    let used = self.budget.tokens_used().await;
                    self.events.emit(&EngineEvent::BudgetExhausted {
                        used,
                        limit: self.budget.total_limit(),
                    });
                    break RunOutcome::BudgetExhausted;
                }
                if self.has_dispatchable().await? {
                    continue;
                }
                if self.try_review().await? {
                    continue;
                }
                break self.settle_outcome().await?;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break RunOutcome::Interrupted,
                report = self.reports.recv() => match report {
                    Some(report) => self.handle_report(report).await?,
                    None => {
                        warn!("report channel closed with work in flight");
                        break RunOutcome::Interrupted;
                    }
                },
                Some(task_id) = self.wakeup_rx.recv() => self.handle_wakeup(task_id).await?,
            }
        };

        info!(outcome = outcome.as_str(), "planner finished");
        Ok((outcome, self.pool))
    }

    /// Fail every dependency-cycle member before any dispatch, then let the
    /// frontier sweep block their dependents. Planning continues on the
    /// acyclic remainder.
    async fn fail_cycles(&mut self) -> eyre::Result<()> {
        let tasks = self.store.list_all().await.map_err(|e| eyre::eyre!("Failed to list tasks: {}", e))?;
        let active: Vec<_> = tasks.into_iter().filter(|t| !t.is_terminal()).collect();
        let members = detect_cycles(&active);

        for task_id in members {
            let message = "task participates in a dependency cycle".to_string();
            let result = self
                .store
                .transition(
                    &task_id,
                    TaskStatus::Pending,
                    TaskStatus::Failed,
                    Some(Box::new({
                        let message = message.clone();
                        move |t| t.set_error(TaskError::new(ErrorKind::DependencyCycle, message.clone()))
                    })),
                )
                .await;
            match result {
                Ok(_) => {
                    warn!(task_id = %task_id, "dependency cycle member failed");
                    self.events.emit(&EngineEvent::TaskFailed {
                        task_id,
                        kind: ErrorKind::DependencyCycle,
                        message,
                    });
                }
                Err(e) => warn!(task_id = %task_id, error = %e, "failed to mark cycle member"),
            }
        }
        Ok(())
    }

    /// Submit ready tasks in deterministic order, stopping at the first
    /// strict budget refusal.
    async fn dispatch_ready(&mut self) -> eyre::Result<()> {
        let tasks = self.store.list_all().await.map_err(|e| eyre::eyre!("Failed to list tasks: {}", e))?;
        let active: Vec<_> = tasks.iter().filter(|t| !t.is_terminal()).cloned().collect();
        let order = topological_order(&active);

        for task_id in order {
            let task = active.iter().find(|t| t.id == task_id).expect("ordered id");
            if task.status != TaskStatus::Ready
                || self.in_flight.contains(&task_id)
                || self.waiting.contains(&task_id)
            {
                continue;
            }

            let (admission, crossed_warning) = self.budget.admit().await;
            if crossed_warning {
                self.emit_budget_warning().await;
            }
            if admission == Admission::Refused {
                info!(task_id = %task_id, "budget refused dispatch, pausing submissions");
                self.budget_refused = true;
                break;
            }

            debug!(task_id = %task_id, "dispatching");
            self.pool.submit(&task_id).await?;
            self.in_flight.insert(task_id);
        }
        Ok(())
    }

    /// Whether anything is ready (or could become ready) to dispatch
    async fn has_dispatchable(&self) -> eyre::Result<bool> {
        let tasks = self.store.list_all().await.map_err(|e| eyre::eyre!("Failed to list tasks: {}", e))?;
        Ok(tasks
            .iter()
            .any(|t| t.status == TaskStatus::Ready && !self.in_flight.contains(&t.id) && !self.waiting.contains(&t.id)))
    }

    /// Process one executor report; reports arrive in completion order
    async fn handle_report(&mut self, report: ExecReport) -> eyre::Result<()> {
        self.in_flight.remove(report.task_id());

        match report {
            ExecReport::Completed { task_id, tokens_used, .. } => {
                debug!(task_id = %task_id, tokens_used, "completion processed");
            }
            ExecReport::Failed { task_id, error, .. } => {
                let task = self.store.get(&task_id).await.map_err(|e| eyre::eyre!("{}", e))?;
                if self.config.retry.should_retry(error.kind, task.attempts) {
                    let delay = self.config.retry.delay_for_attempt(task.attempts);
                    info!(
                        task_id = %task_id,
                        attempts = task.attempts,
                        ?delay,
                        "scheduling retry"
                    );
                    self.schedule_wakeup(task_id, delay);
                } else {
                    info!(task_id = %task_id, kind = %error.kind, "task failed permanently");
                    self.events.emit(&EngineEvent::TaskFailed {
                        task_id,
                        kind: error.kind,
                        message: error.message,
                    });
                }
            }
            ExecReport::Released { task_id, reason, .. } => match reason {
                ReleaseReason::LostRace | ReleaseReason::Cancelled => {}
                ReleaseReason::BudgetRefused => {
                    self.budget_refused = true;
                }
                ReleaseReason::BreakerOpen { retry_in } => {
                    debug!(task_id = %task_id, ?retry_in, "deferring past breaker cooldown");
                    self.schedule_wakeup(task_id, retry_in);
                }
            },
        }
        Ok(())
    }

    fn schedule_wakeup(&mut self, task_id: String, delay: Duration) {
        self.waiting.insert(task_id.clone());
        let tx = self.wakeup_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(task_id).await;
        });
    }

    /// A scheduled wakeup fired: failed tasks go back to ready, deferred
    /// tasks simply become dispatchable again.
    async fn handle_wakeup(&mut self, task_id: String) -> eyre::Result<()> {
        self.waiting.remove(&task_id);

        match self
            .store
            .transition(&task_id, TaskStatus::Failed, TaskStatus::Ready, None)
            .await
        {
            Ok(_) => debug!(task_id = %task_id, "retry ready"),
            // Breaker deferrals are already ready; anything else is a
            // state the wakeup no longer applies to
            Err(StoreError::InvalidTransition { .. }) => {}
            Err(e) => return Err(eyre::eyre!("Failed to wake {}: {}", task_id, e)),
        }
        Ok(())
    }

    /// Run one review round if any remain. Returns true when new tasks were
    /// appended and planning should continue.
    async fn try_review(&mut self) -> eyre::Result<bool> {
        if self.review_rounds >= self.config.review_depth {
            return Ok(false);
        }

        // The review invocation is itself subject to admission, but a
        // refusal here ends the run quietly rather than as exhaustion
        let (admission, crossed_warning) = self.budget.admit().await;
        if crossed_warning {
            self.emit_budget_warning().await;
        }
        if admission == Admission::Refused {
            info!("budget refused the review pass");
            return Ok(false);
        }

        self.review_rounds += 1;
        self.events.emit(&EngineEvent::ReviewStarted {
            round: self.review_rounds,
        });

        let (outcome, tokens_used) = review_round(
            &self.store,
            &self.tool,
            &self.config.workdir,
            self.config.worker_timeout,
            self.cancel.clone(),
        )
        .await?;

        if tokens_used > 0 && self.budget.record(REVIEW_TASK_ID, tokens_used).await {
            self.emit_budget_warning().await;
        }

        match outcome {
            ReviewOutcome::Emitted(count) => {
                self.events.emit(&EngineEvent::ReviewEmitted {
                    round: self.review_rounds,
                    new_tasks: count,
                });
                Ok(true)
            }
            ReviewOutcome::Quiet | ReviewOutcome::Aborted(_) => Ok(false),
        }
    }

    /// Final outcome from settled task statuses
    async fn settle_outcome(&self) -> eyre::Result<RunOutcome> {
        let tasks = self.store.list_all().await.map_err(|e| eyre::eyre!("Failed to list tasks: {}", e))?;
        let any_unfinished = tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Blocked));
        Ok(if any_unfinished {
            RunOutcome::TasksFailed
        } else {
            RunOutcome::Completed
        })
    }

    async fn emit_budget_warning(&self) {
        self.events.emit(&EngineEvent::BudgetWarning {
            used: self.budget.tokens_used().await,
            limit: self.budget.total_limit(),
        });
    }
}
