//! Checkpoint store
//!
//! One file per checkpoint, partitioned by state, plus an append-only index
//! mapping task ids to their ordered checkpoint ids. Writes go through a
//! tempfile-then-rename so a crash never leaves a half-written record.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{Checkpoint, CheckpointState, now_ms};

/// State partitions on disk
const PARTITIONS: [&str; 3] = ["active", "completed", "failed"];

/// Errors from checkpoint operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    #[error("Checkpoint already exists: {0}")]
    Duplicate(String),

    #[error("Invalid checkpoint transition: {from} -> {to}")]
    InvalidTransition {
        from: CheckpointState,
        to: CheckpointState,
    },

    #[error("Checkpoint corrupted: {0}")]
    Corrupt(String),

    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Filter for list operations
#[derive(Debug, Clone, Default)]
pub struct CheckpointFilter {
    pub task_id: Option<String>,
    pub state: Option<CheckpointState>,
}

/// Durable per-step snapshots under a root directory
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Open (creating partitions as needed) and verify index consistency,
    /// rebuilding the index from the partitions when it disagrees.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let root = root.as_ref().to_path_buf();
        for partition in PARTITIONS {
            fs::create_dir_all(root.join(partition))?;
        }

        let store = Self { root };
        if !store.index_consistent()? {
            warn!(root = %store.root.display(), "checkpoint index inconsistent, rebuilding");
            store.rebuild_index()?;
        }
        Ok(store)
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index")
    }

    fn partition_for(state: CheckpointState) -> &'static str {
        match state {
            CheckpointState::Completed => "completed",
            CheckpointState::Failed => "failed",
            // Created / Active / Restored all live in active/
            _ => "active",
        }
    }

    fn path_for(&self, state: CheckpointState, id: &str) -> PathBuf {
        self.root.join(Self::partition_for(state)).join(id)
    }

    /// Find a checkpoint file across partitions
    fn locate(&self, id: &str) -> Option<PathBuf> {
        PARTITIONS
            .iter()
            .map(|p| self.root.join(p).join(id))
            .find(|path| path.exists())
    }

    fn write_record(&self, cp: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(cp.state, &cp.id);
        let dir = path.parent().expect("partition dir");
        let json = serde_json::to_string_pretty(cp)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(&path).map_err(|e| CheckpointError::Io(e.error))?;
        Ok(())
    }

    fn read_record(&self, path: &Path) -> Result<Checkpoint, CheckpointError> {
        let content = fs::read_to_string(path)?;
        let cp: Checkpoint =
            serde_json::from_str(&content).map_err(|e| CheckpointError::Corrupt(format!("{}: {}", path.display(), e)))?;
        if !cp.verify() {
            return Err(CheckpointError::Corrupt(format!("checksum mismatch: {}", path.display())));
        }
        Ok(cp)
    }

    fn append_index(&self, task_id: &str, cp_id: &str) -> Result<(), CheckpointError> {
        let mut file = fs::OpenOptions::new().create(true).append(true).open(self.index_path())?;
        writeln!(file, "{}\t{}", task_id, cp_id)?;
        Ok(())
    }

    /// Read the index as task_id -> ordered checkpoint ids
    fn read_index(&self) -> Result<HashMap<String, Vec<String>>, CheckpointError> {
        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        let path = self.index_path();
        if !path.exists() {
            return Ok(index);
        }
        for line in fs::read_to_string(&path)?.lines() {
            if let Some((task_id, cp_id)) = line.split_once('\t') {
                index.entry(task_id.to_string()).or_default().push(cp_id.to_string());
            }
        }
        Ok(index)
    }

    /// Every indexed id must exist on disk and every record must be indexed
    fn index_consistent(&self) -> Result<bool, CheckpointError> {
        let index = self.read_index()?;
        let indexed: Vec<&String> = index.values().flatten().collect();

        for cp_id in &indexed {
            if self.locate(cp_id).is_none() {
                return Ok(false);
            }
        }

        let on_disk = self.all_record_ids()?;
        for id in &on_disk {
            if !indexed.iter().any(|i| *i == id) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn all_record_ids(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids = Vec::new();
        for partition in PARTITIONS {
            let dir = self.root.join(partition);
            for entry in fs::read_dir(&dir)? {
                ids.push(entry?.file_name().to_string_lossy().to_string());
            }
        }
        Ok(ids)
    }

    /// Rebuild the index from the partition directories, ordered by
    /// creation time.
    pub fn rebuild_index(&self) -> Result<(), CheckpointError> {
        let mut records = Vec::new();
        for partition in PARTITIONS {
            let dir = self.root.join(partition);
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                match self.read_record(&path) {
                    Ok(cp) => records.push(cp),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint during rebuild"),
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut content = String::new();
        for cp in &records {
            content.push_str(&format!("{}\t{}\n", cp.task_id, cp.id));
        }

        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(self.index_path()).map_err(|e| CheckpointError::Io(e.error))?;

        info!(count = records.len(), "rebuilt checkpoint index");
        Ok(())
    }

    /// Store a new checkpoint; duplicate ids are rejected, never silently
    /// overwritten.
    pub fn create(&self, cp: &Checkpoint) -> Result<(), CheckpointError> {
        if self.locate(&cp.id).is_some() {
            return Err(CheckpointError::Duplicate(cp.id.clone()));
        }
        self.write_record(cp)?;
        self.append_index(&cp.task_id, &cp.id)?;
        debug!(cp_id = %cp.id, task_id = %cp.task_id, "created checkpoint");
        Ok(())
    }

    /// Load a checkpoint by id, verifying its checksum
    pub fn get(&self, id: &str) -> Result<Checkpoint, CheckpointError> {
        let path = self.locate(id).ok_or_else(|| CheckpointError::NotFound(id.to_string()))?;
        self.read_record(&path)
    }

    /// Replace the payload of an existing checkpoint
    pub fn update(&self, id: &str, data: serde_json::Value) -> Result<Checkpoint, CheckpointError> {
        let mut cp = self.get(id)?;
        cp.set_data(data);
        self.write_record(&cp)?;
        Ok(cp)
    }

    fn transition(&self, id: &str, to: CheckpointState) -> Result<Checkpoint, CheckpointError> {
        let old_path = self.locate(id).ok_or_else(|| CheckpointError::NotFound(id.to_string()))?;
        let mut cp = self.read_record(&old_path)?;
        let from = cp.state;

        if !cp.transition(to) {
            return Err(CheckpointError::InvalidTransition { from, to });
        }

        self.write_record(&cp)?;
        // Moving between partitions leaves no stale copy behind
        let new_path = self.path_for(cp.state, id);
        if old_path != new_path {
            fs::remove_file(&old_path)?;
        }
        debug!(cp_id = %id, from = %from, to = %to, "checkpoint transition");
        Ok(cp)
    }

    /// Created -> Active
    pub fn activate(&self, id: &str) -> Result<Checkpoint, CheckpointError> {
        self.transition(id, CheckpointState::Active)
    }

    /// Active -> Completed, merging the final payload
    pub fn complete(&self, id: &str, final_data: serde_json::Value) -> Result<Checkpoint, CheckpointError> {
        let mut cp = self.get(id)?;
        if !CheckpointState::can_transition(cp.state, CheckpointState::Completed) {
            return Err(CheckpointError::InvalidTransition {
                from: cp.state,
                to: CheckpointState::Completed,
            });
        }
        cp.set_data(final_data);
        self.write_record(&cp)?;
        self.transition(id, CheckpointState::Completed)
    }

    /// Active -> Failed, recording the error
    pub fn fail(&self, id: &str, error: &str) -> Result<Checkpoint, CheckpointError> {
        let mut cp = self.get(id)?;
        if !CheckpointState::can_transition(cp.state, CheckpointState::Failed) {
            return Err(CheckpointError::InvalidTransition {
                from: cp.state,
                to: CheckpointState::Failed,
            });
        }
        let mut data = cp.data.clone();
        if let Some(obj) = data.as_object_mut() {
            obj.insert("error".to_string(), serde_json::Value::String(error.to_string()));
        } else {
            data = serde_json::json!({ "error": error });
        }
        cp.set_data(data);
        self.write_record(&cp)?;
        self.transition(id, CheckpointState::Failed)
    }

    /// Failed -> Restored
    pub fn restore(&self, id: &str) -> Result<Checkpoint, CheckpointError> {
        self.transition(id, CheckpointState::Restored)
    }

    /// Newest non-completed checkpoint for a task
    pub fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let index = self.read_index()?;
        let Some(ids) = index.get(task_id) else {
            return Ok(None);
        };

        let mut newest: Option<Checkpoint> = None;
        for id in ids {
            let cp = self.get(id)?;
            if !cp.state.is_resumable() {
                continue;
            }
            if newest.as_ref().map(|n| cp.created_at > n.created_at).unwrap_or(true) {
                newest = Some(cp);
            }
        }
        Ok(newest)
    }

    /// List checkpoints matching a filter, ordered by creation time
    pub fn list(&self, filter: &CheckpointFilter) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut out = Vec::new();
        for id in self.all_record_ids()? {
            let cp = self.get(&id)?;
            if let Some(task_id) = &filter.task_id
                && &cp.task_id != task_id
            {
                continue;
            }
            if let Some(state) = filter.state
                && cp.state != state
            {
                continue;
            }
            out.push(cp);
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Remove completed and failed checkpoints older than `max_age_ms`.
    /// Active checkpoints are never collected. Returns the removed count.
    pub fn gc(&self, max_age_ms: i64) -> Result<usize, CheckpointError> {
        let cutoff = now_ms() - max_age_ms;
        let mut removed = 0;

        for partition in ["completed", "failed"] {
            let dir = self.root.join(partition);
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                match self.read_record(&path) {
                    Ok(cp) if cp.created_at < cutoff => {
                        fs::remove_file(&path)?;
                        removed += 1;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "unreadable checkpoint during gc"),
                }
            }
        }

        if removed > 0 {
            info!(removed, "checkpoint gc removed expired records");
            self.rebuild_index()?;
        }
        Ok(removed)
    }
}
