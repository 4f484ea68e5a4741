//! Executor - one slot in the pool
//!
//! Runs the per-task procedure: reserve, consult budget and breaker, compose
//! the prompt, invoke the tool, validate the claimed files, and write the
//! outcome back. An executor never panics across a task boundary; anything
//! unexpected is classified transient and fed to the normal failure path.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::budget::{Admission, BudgetGovernor};
use crate::checkpoint::CheckpointStore;
use crate::domain::{ErrorKind, Task, TaskError, TaskOutcome, TaskStatus};
use crate::events::{EngineEvent, EventSink};
use crate::store::{StoreError, TaskStore};
use crate::tool::{ToolClient, ToolError, ToolOutput, ToolRequest};

use super::breaker::{BreakerDecision, CircuitBreaker};
use super::{Dispatch, ExecReport, ReleaseReason};

/// Everything one executor needs to run
pub(super) struct Executor {
    pub id: usize,
    pub store: TaskStore,
    pub checkpoints: Arc<CheckpointStore>,
    pub budget: Arc<BudgetGovernor>,
    pub tool: Arc<dyn ToolClient>,
    pub events: Arc<dyn EventSink>,
    pub breaker: CircuitBreaker,
    pub worker_timeout: Duration,
    pub workdir: std::path::PathBuf,
    pub queue: Arc<Mutex<mpsc::Receiver<Dispatch>>>,
    pub reports: mpsc::Sender<ExecReport>,
    pub cancel: CancellationToken,
}

impl Executor {
    /// Consume dispatches until the queue closes or the engine cancels
    pub async fn run(mut self) {
        debug!(executor_id = self.id, "executor started");

        loop {
            let dispatch = {
                let mut queue = self.queue.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    dispatch = queue.recv() => dispatch,
                }
            };

            let Some(dispatch) = dispatch else { break };
            let (report, idle) = self.process(dispatch.task_id.clone()).await;
            let stop = matches!(
                &report,
                ExecReport::Released {
                    reason: ReleaseReason::Cancelled,
                    ..
                }
            );
            if self.reports.send(report).await.is_err() {
                break;
            }
            if stop {
                break;
            }
            // Idle-blocked while this executor's breaker cools down; the
            // release report already went out so the planner keeps moving
            if let Some(cooldown) = idle {
                tokio::select! {
                    _ = tokio::time::sleep(cooldown) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }

        debug!(executor_id = self.id, "executor stopped");
    }

    /// The per-task procedure. Returns the report plus an optional idle
    /// period (breaker cooldown) to observe after the report is sent.
    async fn process(&mut self, task_id: String) -> (ExecReport, Option<Duration>) {
        // 1. Reserve. A lost race means another executor holds the task.
        let task = match self
            .store
            .transition(&task_id, TaskStatus::Ready, TaskStatus::Running, None)
            .await
        {
            Ok(task) => task,
            Err(StoreError::InvalidTransition { from, .. }) => {
                debug!(executor_id = self.id, task_id = %task_id, actual = %from, "lost reservation race");
                let report = ExecReport::Released {
                    executor_id: self.id,
                    task_id,
                    reason: ReleaseReason::LostRace,
                };
                return (report, None);
            }
            Err(e) => {
                let report = self.fail_unreserved(task_id, ErrorKind::Transient, format!("reservation failed: {}", e));
                return (report, None);
            }
        };

        // 2. Budget admission
        let (admission, crossed_warning) = self.budget.admit().await;
        if crossed_warning {
            self.emit_budget_warning().await;
        }
        if admission == Admission::Refused {
            debug!(executor_id = self.id, task_id = %task_id, "budget refused, releasing");
            return (self.release(task_id, ReleaseReason::BudgetRefused).await, None);
        }

        // 3. Circuit breaker
        match self.breaker.check() {
            BreakerDecision::Allow | BreakerDecision::Probe => {}
            BreakerDecision::Refuse { retry_in } => {
                info!(executor_id = self.id, task_id = %task_id, ?retry_in, "breaker open, releasing");
                let report = self.release(task_id, ReleaseReason::BreakerOpen { retry_in }).await;
                return (report, Some(retry_in));
            }
        }

        (self.execute(task).await, None)
    }

    /// Steps 4-8: prompt, checkpoint, invoke, parse, validate, bookkeeping
    async fn execute(&mut self, task: Task) -> ExecReport {
        let task_id = task.id.clone();

        // Attempts count actual invocations, so bump only once admission and
        // the breaker have let the task through
        let task = match self.store.update(&task_id, |t| t.increment_attempts()).await {
            Ok(task) => task,
            Err(e) => {
                return self.fail(&task_id, None, ErrorKind::Transient, format!("attempt bookkeeping failed: {}", e)).await;
            }
        };

        let prompt = match self.compose_prompt(&task).await {
            Ok(prompt) => prompt,
            Err(e) => {
                return self.fail(&task_id, None, ErrorKind::Transient, format!("prompt composition failed: {}", e)).await;
            }
        };

        // 5. Checkpoint the invocation step
        let checkpoint = crate::domain::Checkpoint::new(&task_id, task.attempts, "tool invocation").with_data(
            serde_json::json!({
                "attempt": task.attempts,
                "executor": self.id,
                "prompt_chars": prompt.len(),
            }),
        );
        let cp_id = checkpoint.id.clone();
        if let Err(e) = self.checkpoints.create(&checkpoint).and_then(|_| self.checkpoints.activate(&cp_id)) {
            return self.fail(&task_id, None, ErrorKind::Transient, format!("checkpoint write failed: {}", e)).await;
        }

        self.events.emit(&EngineEvent::TaskStarted {
            task_id: task_id.clone(),
            executor_id: self.id,
            attempt: task.attempts,
        });

        // 6. Invoke the tool under the wall-clock limit
        let request = ToolRequest {
            task_id: task_id.clone(),
            prompt,
            workdir: self.workdir.clone(),
            timeout: self.worker_timeout,
        };

        match self.tool.invoke(request, self.cancel.clone()).await {
            Ok(output) => {
                // 7. Validate claimed files before accepting the result
                if let Err(message) = validate_files(&self.workdir, &output) {
                    return self.fail(&task_id, Some(&cp_id), ErrorKind::Validation, message).await;
                }
                self.succeed(&task_id, &cp_id, output).await
            }
            Err(ToolError::Cancelled) => {
                info!(executor_id = self.id, task_id = %task_id, "invocation cancelled, restoring");
                let _ = self.checkpoints.fail(&cp_id, "interrupted by shutdown");
                let _ = self.checkpoints.restore(&cp_id);
                self.release(task_id, ReleaseReason::Cancelled).await
            }
            Err(e) => {
                let kind = e.kind();
                self.fail(&task_id, Some(&cp_id), kind, e.to_string()).await
            }
        }
    }

    /// 8a. Success bookkeeping
    async fn succeed(&mut self, task_id: &str, cp_id: &str, output: ToolOutput) -> ExecReport {
        let tokens_used = output.tokens_used;
        let outcome = TaskOutcome {
            text: output.text,
            created_files: output.created_files,
            modified_files: output.modified_files,
            tokens_used,
        };

        let result = self
            .store
            .transition(
                task_id,
                TaskStatus::Running,
                TaskStatus::Completed,
                Some(Box::new(move |t| {
                    t.set_result(outcome.clone());
                    t.retry_context = None;
                })),
            )
            .await;

        if let Err(e) = result {
            return self.fail(task_id, Some(cp_id), ErrorKind::Transient, format!("result write failed: {}", e)).await;
        }

        if self.budget.record(task_id, tokens_used).await {
            self.emit_budget_warning().await;
        }
        self.breaker.on_success();

        if let Err(e) = self.checkpoints.complete(cp_id, serde_json::json!({ "tokens_used": tokens_used })) {
            warn!(task_id = %task_id, error = %e, "failed to complete checkpoint");
        }

        self.events.emit(&EngineEvent::TaskCompleted {
            task_id: task_id.to_string(),
            tokens_used,
        });

        info!(executor_id = self.id, task_id = %task_id, tokens_used, "task completed");
        ExecReport::Completed {
            executor_id: self.id,
            task_id: task_id.to_string(),
            tokens_used,
        }
    }

    /// 8b. Failure bookkeeping for a reserved task
    async fn fail(&mut self, task_id: &str, cp_id: Option<&str>, kind: ErrorKind, message: String) -> ExecReport {
        let error = TaskError::new(kind, message.clone());
        let summary = error.one_line();

        let result = self
            .store
            .transition(
                task_id,
                TaskStatus::Running,
                TaskStatus::Failed,
                Some(Box::new({
                    let error = error.clone();
                    move |t| {
                        t.set_error(error.clone());
                        t.set_retry_context(format!("previous attempt failed with {}", summary));
                    }
                })),
            )
            .await;
        if let Err(e) = result {
            warn!(task_id = %task_id, error = %e, "failed to record task failure");
        }

        if let Some(cp_id) = cp_id
            && let Err(e) = self.checkpoints.fail(cp_id, &message)
        {
            warn!(task_id = %task_id, error = %e, "failed to fail checkpoint");
        }

        if kind.counts_against_breaker() {
            self.breaker.on_failure();
        }

        warn!(executor_id = self.id, task_id = %task_id, kind = %kind, %message, "task attempt failed");
        ExecReport::Failed {
            executor_id: self.id,
            task_id: task_id.to_string(),
            error,
        }
    }

    /// Failure before the task was ever reserved
    fn fail_unreserved(&self, task_id: String, kind: ErrorKind, message: String) -> ExecReport {
        warn!(executor_id = self.id, task_id = %task_id, %message, "dispatch failed before reservation");
        ExecReport::Failed {
            executor_id: self.id,
            task_id: task_id.clone(),
            error: TaskError::new(kind, message),
        }
    }

    /// Hand a reserved task back to the frontier
    async fn release(&self, task_id: String, reason: ReleaseReason) -> ExecReport {
        if let Err(e) = self
            .store
            .transition(&task_id, TaskStatus::Running, TaskStatus::Ready, None)
            .await
        {
            warn!(task_id = %task_id, error = %e, "failed to release task");
        }
        ExecReport::Released {
            executor_id: self.id,
            task_id,
            reason,
        }
    }

    async fn emit_budget_warning(&self) {
        self.events.emit(&EngineEvent::BudgetWarning {
            used: self.budget.tokens_used().await,
            limit: self.budget.total_limit(),
        });
    }

    /// 4. Compose the prompt: description, resolved dependency results, and
    /// any retry context from the previous attempt.
    async fn compose_prompt(&self, task: &Task) -> eyre::Result<String> {
        let mut sections = Vec::new();
        sections.push(format!("# Task: {}\n\n{}", task.title, task.description));

        if !task.deps.is_empty() {
            let mut dep_section = String::from("# Completed dependencies\n");
            for dep_id in &task.deps {
                let dep = self
                    .store
                    .get(dep_id)
                    .await
                    .map_err(|e| eyre::eyre!("dependency {} unavailable: {}", dep_id, e))?;
                let text = dep.result.as_ref().map(|r| r.text.as_str()).unwrap_or("(no output recorded)");
                dep_section.push_str(&format!("\n## {} ({})\n{}\n", dep.id, dep.title, text));
            }
            sections.push(dep_section);
        }

        if let Some(context) = &task.retry_context {
            sections.push(format!("# Retry context\n{}", context));
        }

        Ok(sections.join("\n\n"))
    }
}

/// Every file the tool claims to have touched must exist and be non-empty
fn validate_files(workdir: &Path, output: &ToolOutput) -> Result<(), String> {
    let mut missing = Vec::new();
    for file in output.created_files.iter().chain(output.modified_files.iter()) {
        let path = workdir.join(file);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => missing.push(format!("{} is empty", file)),
            Err(_) => missing.push(format!("{} does not exist", file)),
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("claimed files failed validation: {}", missing.join(", ")))
    }
}
