//! Ready-frontier computation
//!
//! A pending task becomes ready when every dependency has completed. A task
//! whose dependency failed permanently becomes blocked, and the blockage
//! recurses to its dependents. Reverse edges are never stored; the sweep
//! reaches a fixpoint instead.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::domain::TaskStatus;
use crate::store::TaskStore;

/// Result of one frontier sweep
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub promoted: Vec<String>,
    /// (task id, failed dependency id)
    pub blocked: Vec<(String, String)>,
}

/// Promote pending tasks whose dependencies are complete and block tasks
/// whose dependencies failed permanently.
///
/// `retrying` holds ids that are failed right now but have a retry
/// scheduled; they do not count as permanent failures.
pub async fn sweep(store: &TaskStore, retrying: &HashSet<String>) -> eyre::Result<SweepStats> {
    let mut stats = SweepStats::default();

    // Fixpoint: each pass can unlock or block further dependents
    loop {
        let tasks = store.list_all().await.map_err(|e| eyre::eyre!("Failed to list tasks: {}", e))?;
        let status_of: HashMap<&str, TaskStatus> = tasks.iter().map(|t| (t.id.as_str(), t.status)).collect();

        let mut changed = false;
        for task in &tasks {
            if task.status != TaskStatus::Pending {
                continue;
            }

            let mut ready = true;
            let mut failed_dep: Option<String> = None;

            for dep in &task.deps {
                match status_of.get(dep.as_str()) {
                    Some(TaskStatus::Completed) => {}
                    Some(TaskStatus::Failed) if !retrying.contains(dep) => {
                        failed_dep = Some(dep.clone());
                        break;
                    }
                    Some(TaskStatus::Blocked) => {
                        failed_dep = Some(dep.clone());
                        break;
                    }
                    Some(_) => {
                        ready = false;
                    }
                    None => {
                        // Dependency ids are supposed to resolve; an unknown
                        // id can only come from a hand-edited store file
                        warn!(task_id = %task.id, dep = %dep, "dependency does not exist, blocking task");
                        failed_dep = Some(dep.clone());
                        break;
                    }
                }
            }

            if let Some(dep) = failed_dep {
                store
                    .transition(&task.id, TaskStatus::Pending, TaskStatus::Blocked, None)
                    .await
                    .map_err(|e| eyre::eyre!("Failed to block {}: {}", task.id, e))?;
                debug!(task_id = %task.id, failed_dep = %dep, "blocked on failed dependency");
                stats.blocked.push((task.id.clone(), dep));
                changed = true;
            } else if ready {
                store
                    .transition(&task.id, TaskStatus::Pending, TaskStatus::Ready, None)
                    .await
                    .map_err(|e| eyre::eyre!("Failed to promote {}: {}", task.id, e))?;
                stats.promoted.push(task.id.clone());
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    Ok(stats)
}
