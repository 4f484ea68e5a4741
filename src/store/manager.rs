//! TaskStore - actor that owns the task index
//!
//! All mutations are serialized through a single actor task; every mutation
//! is flushed write-through to the store file. The cloneable handle is the
//! transactional API the planner and executors share.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::{Task, TaskFilter, TaskStatus};
use crate::progress::ProgressSink;

use super::messages::{StoreCommand, StoreError, StoreResponse, TaskMutator};
use super::persist;

/// Internal retry count for compare-and-swap updates
const CAS_RETRIES: u32 = 3;

/// Handle to the store actor
#[derive(Clone)]
pub struct TaskStore {
    tx: mpsc::Sender<StoreCommand>,
}

impl TaskStore {
    /// Open the store directory and spawn the actor.
    ///
    /// Loads `tasks.json` once; a corrupted file is a fatal error. An
    /// advisory lock on `<dir>/.lock` guards against two engines sharing one
    /// store.
    pub fn open(dir: impl AsRef<Path>, progress: Arc<dyn ProgressSink>) -> eyre::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let lock_path = dir.join(".lock");
        let lock = std::fs::File::create(&lock_path)?;
        lock.try_lock_exclusive()
            .map_err(|_| eyre::eyre!("Store directory already locked by another engine: {}", dir.display()))?;

        let path = dir.join("tasks.json");
        let index = persist::load(&path).map_err(|e| eyre::eyre!("Failed to load task store: {}", e))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(
            StoreInner {
                path,
                index,
                lock: Some(lock),
                progress,
            },
            rx,
        ));

        info!(dir = %dir.display(), "TaskStore opened");
        Ok(Self { tx })
    }

    /// Get a task by id
    pub async fn get(&self, id: &str) -> StoreResponse<Task> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Get {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| StoreError::Channel)?;
        rx.await.map_err(|_| StoreError::Channel)?
    }

    /// Insert a new task; an existing id is rejected
    pub async fn insert(&self, task: Task) -> StoreResponse<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Insert { task, reply })
            .await
            .map_err(|_| StoreError::Channel)?;
        rx.await.map_err(|_| StoreError::Channel)?
    }

    /// Replace a task, comparing against the `updated_at` the caller read
    pub async fn put(&self, task: Task, expected_updated_at: i64) -> StoreResponse<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Put {
                task,
                expected_updated_at,
                reply,
            })
            .await
            .map_err(|_| StoreError::Channel)?;
        rx.await.map_err(|_| StoreError::Channel)?
    }

    /// Read-modify-write with internal conflict retry.
    ///
    /// Re-reads and reapplies the mutator up to 3 times before surfacing
    /// `Conflict`.
    pub async fn update<F>(&self, id: &str, mutator: F) -> StoreResponse<Task>
    where
        F: Fn(&mut Task) + Send,
    {
        let mut last_err = StoreError::Conflict(id.to_string());
        for attempt in 0..CAS_RETRIES {
            let task = self.get(id).await?;
            let expected = task.updated_at;
            let mut updated = task;
            mutator(&mut updated);
            match self.put(updated.clone(), expected).await {
                Ok(()) => return Ok(updated),
                Err(StoreError::Conflict(_)) => {
                    debug!(%id, attempt, "put conflict, retrying");
                    last_err = StoreError::Conflict(id.to_string());
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// List tasks matching a filter
    pub async fn list(&self, filter: TaskFilter) -> StoreResponse<Vec<Task>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::List { filter, reply })
            .await
            .map_err(|_| StoreError::Channel)?;
        rx.await.map_err(|_| StoreError::Channel)?
    }

    /// List every task
    pub async fn list_all(&self) -> StoreResponse<Vec<Task>> {
        self.list(TaskFilter::default()).await
    }

    /// Atomically transition a task's status, applying `mutator` under the
    /// same lock.
    ///
    /// The current status must equal `from`; a lost reservation race
    /// surfaces as `InvalidTransition` with the actual status. `from == to`
    /// is a permitted no-op.
    pub async fn transition(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        mutator: Option<TaskMutator>,
    ) -> StoreResponse<Task> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Transition {
                id: id.to_string(),
                from,
                to,
                mutator,
                reply,
            })
            .await
            .map_err(|_| StoreError::Channel)?;
        rx.await.map_err(|_| StoreError::Channel)?
    }

    /// Replace several tasks in one flush
    pub async fn batch_update(&self, tasks: Vec<Task>) -> StoreResponse<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::BatchUpdate { tasks, reply })
            .await
            .map_err(|_| StoreError::Channel)?;
        rx.await.map_err(|_| StoreError::Channel)?
    }

    /// Force a flush of the store file
    pub async fn flush(&self) -> StoreResponse<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Flush { reply })
            .await
            .map_err(|_| StoreError::Channel)?;
        rx.await.map_err(|_| StoreError::Channel)?
    }

    /// Flush and stop the actor
    pub async fn shutdown(&self) -> StoreResponse<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Shutdown { reply })
            .await
            .map_err(|_| StoreError::Channel)?;
        rx.await.map_err(|_| StoreError::Channel)?;
        Ok(())
    }
}

/// State owned by the actor
struct StoreInner {
    path: PathBuf,
    index: HashMap<String, Task>,
    /// Held for the lifetime of the store; released before the shutdown
    /// reply so a reopen never races the old actor
    lock: Option<std::fs::File>,
    progress: Arc<dyn ProgressSink>,
}

impl StoreInner {
    fn flush(&self) -> StoreResponse<()> {
        persist::save(&self.path, &self.index)
    }

    fn get(&self, id: &str) -> StoreResponse<Task> {
        self.index.get(id).cloned().ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn insert(&mut self, task: Task) -> StoreResponse<()> {
        if self.index.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists(task.id));
        }
        self.index.insert(task.id.clone(), task);
        self.flush()
    }

    fn put(&mut self, task: Task, expected_updated_at: i64) -> StoreResponse<()> {
        let current = self
            .index
            .get(&task.id)
            .ok_or_else(|| StoreError::NotFound(task.id.clone()))?;
        if current.updated_at != expected_updated_at {
            return Err(StoreError::Conflict(task.id));
        }
        self.index.insert(task.id.clone(), task);
        self.flush()
    }

    fn transition(
        &mut self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        mutator: Option<TaskMutator>,
    ) -> StoreResponse<Task> {
        let task = self.index.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if task.status != from {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to,
            });
        }
        if !TaskStatus::can_transition(from, to) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }

        if from == to && mutator.is_none() {
            // Identity transition with nothing to apply: no-op success
            return Ok(task.clone());
        }

        task.set_status(to);
        if let Some(mutator) = mutator {
            mutator(task);
        }
        let updated = task.clone();
        self.flush()?;

        if from != to {
            self.progress.transition(id, from, to);
        }
        Ok(updated)
    }

    fn batch_update(&mut self, tasks: Vec<Task>) -> StoreResponse<()> {
        for task in tasks {
            self.index.insert(task.id.clone(), task);
        }
        self.flush()
    }
}

/// The actor loop: processes commands until shutdown
async fn actor_loop(mut inner: StoreInner, mut rx: mpsc::Receiver<StoreCommand>) {
    debug!("TaskStore actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StoreCommand::Get { id, reply } => {
                let _ = reply.send(inner.get(&id));
            }
            StoreCommand::Insert { task, reply } => {
                let _ = reply.send(inner.insert(task));
            }
            StoreCommand::Put {
                task,
                expected_updated_at,
                reply,
            } => {
                let _ = reply.send(inner.put(task, expected_updated_at));
            }
            StoreCommand::List { filter, reply } => {
                let mut tasks: Vec<Task> = inner.index.values().filter(|t| filter.matches(t)).cloned().collect();
                tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
                let _ = reply.send(Ok(tasks));
            }
            StoreCommand::Transition {
                id,
                from,
                to,
                mutator,
                reply,
            } => {
                let _ = reply.send(inner.transition(&id, from, to, mutator));
            }
            StoreCommand::BatchUpdate { tasks, reply } => {
                let _ = reply.send(inner.batch_update(tasks));
            }
            StoreCommand::Flush { reply } => {
                let _ = reply.send(inner.flush());
            }
            StoreCommand::Shutdown { reply } => {
                if let Err(e) = inner.flush() {
                    warn!(error = %e, "Final store flush failed");
                }
                inner.lock.take();
                let _ = reply.send(());
                break;
            }
        }
    }

    debug!("TaskStore actor stopped");
}
