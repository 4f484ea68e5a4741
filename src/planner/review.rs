//! Review pass
//!
//! After the frontier drains, the planner invokes the tool once more with a
//! summary of the run. Follow-up tasks arrive through the structured output
//! header; anything malformed ends the review rather than being guessed at.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{Task, TaskStatus};
use crate::store::TaskStore;
use crate::tool::{NewTask, ToolClient, ToolRequest};

/// Synthetic task id used for budget accounting of review invocations
pub const REVIEW_TASK_ID: &str = "review";

/// Outcome of one review round
#[derive(Debug, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// New tasks were appended to the store
    Emitted(usize),
    /// The review produced nothing new
    Quiet,
    /// The invocation failed or violated the contract; review ends
    Aborted(String),
}

/// Run one review round: summarize the store, invoke the tool, and append
/// any well-formed follow-up tasks.
pub async fn review_round(
    store: &TaskStore,
    tool: &Arc<dyn ToolClient>,
    workdir: &PathBuf,
    timeout: Duration,
    cancel: CancellationToken,
) -> eyre::Result<(ReviewOutcome, u64)> {
    let tasks = store.list_all().await.map_err(|e| eyre::eyre!("Failed to list tasks: {}", e))?;
    let prompt = summary_prompt(&tasks);

    let request = ToolRequest {
        task_id: REVIEW_TASK_ID.to_string(),
        prompt,
        workdir: workdir.clone(),
        timeout,
    };

    let output = match tool.invoke(request, cancel).await {
        Ok(output) => output,
        Err(e) => {
            warn!(error = %e, "review invocation failed");
            return Ok((ReviewOutcome::Aborted(e.to_string()), 0));
        }
    };
    let tokens_used = output.tokens_used;

    if output.new_tasks.is_empty() {
        debug!("review emitted no new tasks");
        return Ok((ReviewOutcome::Quiet, tokens_used));
    }

    match append_new_tasks(store, &tasks, output.new_tasks).await? {
        Ok(count) => {
            info!(count, "review appended follow-up tasks");
            Ok((ReviewOutcome::Emitted(count), tokens_used))
        }
        Err(reason) => {
            warn!(%reason, "review emission rejected");
            Ok((ReviewOutcome::Aborted(reason), tokens_used))
        }
    }
}

/// Validate and insert review-emitted tasks. The whole emission is rejected
/// when any entry has a duplicate id or an unresolvable dependency.
async fn append_new_tasks(
    store: &TaskStore,
    existing: &[Task],
    new_tasks: Vec<NewTask>,
) -> eyre::Result<Result<usize, String>> {
    let mut known: Vec<String> = existing.iter().map(|t| t.id.clone()).collect();

    for new_task in &new_tasks {
        if new_task.id.is_empty() {
            return Ok(Err("emitted task with empty id".to_string()));
        }
        if known.contains(&new_task.id) {
            return Ok(Err(format!("emitted task id already exists: {}", new_task.id)));
        }
        for dep in &new_task.deps {
            if !known.contains(dep) {
                return Ok(Err(format!(
                    "emitted task {} depends on unknown task {}",
                    new_task.id, dep
                )));
            }
        }
        known.push(new_task.id.clone());
    }

    let count = new_tasks.len();
    for new_task in new_tasks {
        let mut task = Task::new(&new_task.id, &new_task.title, &new_task.description)
            .with_priority(new_task.priority);
        for dep in new_task.deps {
            task = task.with_dep(dep);
        }
        store
            .insert(task)
            .await
            .map_err(|e| eyre::eyre!("Failed to insert review task: {}", e))?;
    }

    Ok(Ok(count))
}

/// Summary prompt listing every task with its outcome
fn summary_prompt(tasks: &[Task]) -> String {
    let mut out = String::from(
        "# Review\n\nEvery task in this run has settled. Review the results below. \
         If follow-up work is required, emit it as new_tasks in the output header; \
         otherwise emit an empty list.\n\n",
    );

    for task in tasks {
        out.push_str(&format!("## {} ({}) [{}]\n", task.id, task.title, task.status));
        match task.status {
            TaskStatus::Completed => {
                if let Some(result) = &task.result {
                    out.push_str(&format!("{}\n", result.text));
                }
            }
            _ => {
                if let Some(error) = &task.last_error {
                    out.push_str(&format!("error: {}\n", error));
                }
            }
        }
        out.push('\n');
    }
    out
}
