//! Crash resume
//!
//! On startup, every task the store still shows as running belongs to a
//! previous process. Each one is resolved against its latest non-completed
//! checkpoint: recent enough means the task goes back to ready with a
//! restored marker; stale or missing means the prior progress is not
//! trustworthy and the task fails.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::domain::{ErrorKind, TaskError, TaskFilter, TaskStatus, now_ms};
use crate::events::{EngineEvent, EventSink};
use crate::store::TaskStore;

use super::store::CheckpointStore;

/// Marker prepended to the retry context of a resumed task
pub const RESTORED_MARKER: &str = "restored-from-checkpoint";

/// Resume statistics
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResumeStats {
    /// Tasks returned to ready with a restored checkpoint
    pub restored: usize,
    /// Tasks failed because their checkpoint was stale or missing
    pub stale: usize,
}

impl std::fmt::Display for ResumeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "restored: {}, stale: {}", self.restored, self.stale)
    }
}

/// Run the resume protocol. After this returns no task is left in running.
pub async fn resume(
    store: &TaskStore,
    checkpoints: &CheckpointStore,
    stale_threshold_ms: i64,
    events: &Arc<dyn EventSink>,
) -> eyre::Result<ResumeStats> {
    let mut stats = ResumeStats::default();

    let running = store
        .list(TaskFilter::status(TaskStatus::Running))
        .await
        .map_err(|e| eyre::eyre!("Failed to list running tasks: {}", e))?;

    if running.is_empty() {
        debug!("resume: no interrupted tasks");
        return Ok(stats);
    }

    info!(count = running.len(), "Found interrupted tasks from a previous run");

    for task in running {
        let latest = checkpoints
            .latest(&task.id)
            .map_err(|e| eyre::eyre!("Failed to read checkpoints for {}: {}", task.id, e))?;

        let fresh = latest
            .as_ref()
            .filter(|cp| now_ms() - cp.updated_at <= stale_threshold_ms);

        match fresh {
            Some(cp) => {
                let cp_id = cp.id.clone();
                let context = format!("{}: {}", RESTORED_MARKER, cp_id);
                store
                    .transition(
                        &task.id,
                        TaskStatus::Running,
                        TaskStatus::Ready,
                        Some(Box::new(move |t| t.set_retry_context(context.clone()))),
                    )
                    .await
                    .map_err(|e| eyre::eyre!("Failed to restore {}: {}", task.id, e))?;

                info!(task_id = %task.id, checkpoint = %cp_id, "restored interrupted task");
                events.emit(&EngineEvent::TaskRestored {
                    task_id: task.id.clone(),
                    checkpoint_id: cp_id,
                });
                stats.restored += 1;
            }
            None => {
                let detail = match &latest {
                    Some(cp) => format!("checkpoint {} is older than the stale threshold", cp.id),
                    None => "no checkpoint recorded before the crash".to_string(),
                };
                store
                    .transition(
                        &task.id,
                        TaskStatus::Running,
                        TaskStatus::Failed,
                        Some(Box::new({
                            let detail = detail.clone();
                            move |t| t.set_error(TaskError::new(ErrorKind::StaleCheckpoint, detail.clone()))
                        })),
                    )
                    .await
                    .map_err(|e| eyre::eyre!("Failed to mark {} stale: {}", task.id, e))?;

                warn!(task_id = %task.id, %detail, "interrupted task had no usable checkpoint");
                events.emit(&EngineEvent::TaskFailed {
                    task_id: task.id.clone(),
                    kind: ErrorKind::StaleCheckpoint,
                    message: detail,
                });
                stats.stale += 1;
            }
        }
    }

    info!("Resume complete: {}", stats);
    Ok(stats)
}
