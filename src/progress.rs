//! Progress observation and the terminal summary
//!
//! State transitions flow to a [`ProgressSink`]; the store invokes it for
//! every successful status change. The end-of-run summary renders the task
//! table for the terminal.

use colored::Colorize;
use tracing::info;

use crate::domain::{Task, TaskStatus};

/// Port for observing task state transitions
pub trait ProgressSink: Send + Sync {
    fn transition(&self, task_id: &str, from: TaskStatus, to: TaskStatus);
}

/// Discards transitions
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn transition(&self, _task_id: &str, _from: TaskStatus, _to: TaskStatus) {}
}

/// Logs transitions through tracing
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn transition(&self, task_id: &str, from: TaskStatus, to: TaskStatus) {
        info!(task_id = %task_id, from = %from, to = %to, "task transition");
    }
}

fn status_cell(status: TaskStatus) -> String {
    let text = status.to_string();
    match status {
        TaskStatus::Completed => text.green().to_string(),
        TaskStatus::Failed => text.red().to_string(),
        TaskStatus::Blocked => text.yellow().to_string(),
        TaskStatus::Running => text.cyan().to_string(),
        _ => text,
    }
}

/// Render the per-task summary table with totals
pub fn render_summary(tasks: &[Task]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<20} {:<10} {:<8} {:>8}  {}\n",
        "TASK", "STATUS", "PRIORITY", "ATTEMPTS", "LAST ERROR"
    ));

    let mut sorted: Vec<&Task> = tasks.iter().collect();
    sorted.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    for task in &sorted {
        let error = task.last_error.as_ref().map(|e| e.one_line()).unwrap_or_default();
        out.push_str(&format!(
            "{:<20} {:<10} {:<8} {:>8}  {}\n",
            task.id,
            status_cell(task.status),
            task.priority.to_string(),
            task.attempts,
            error
        ));
    }

    let completed = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count();
    let failed = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count();
    let blocked = tasks.iter().filter(|t| t.status == TaskStatus::Blocked).count();
    let tokens: u64 = tasks.iter().filter_map(|t| t.result.as_ref()).map(|r| r.tokens_used).sum();

    out.push_str(&format!(
        "\n{} tasks: {} completed, {} failed, {} blocked; {} tokens used\n",
        tasks.len(),
        completed,
        failed,
        blocked,
        tokens
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, TaskError, TaskOutcome};

    #[test]
    fn test_summary_lists_tasks_and_totals() {
        let mut done = Task::new("t-1", "a", "b").with_created_at(1);
        done.set_status(TaskStatus::Completed);
        done.set_result(TaskOutcome {
            tokens_used: 250,
            ..Default::default()
        });

        let mut failed = Task::new("t-2", "a", "b").with_created_at(2);
        failed.set_status(TaskStatus::Failed);
        failed.set_error(TaskError::new(ErrorKind::Validation, "missing file"));

        let summary = render_summary(&[failed, done]);
        assert!(summary.contains("t-1"));
        assert!(summary.contains("t-2"));
        assert!(summary.contains("validation_failure: missing file"));
        assert!(summary.contains("2 tasks: 1 completed, 1 failed, 0 blocked; 250 tokens used"));

        // Stable ordering by creation time
        let t1_pos = summary.find("t-1").unwrap();
        let t2_pos = summary.find("t-2").unwrap();
        assert!(t1_pos < t2_pos);
    }
}
