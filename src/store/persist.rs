//! Task store persistence
//!
//! One human-readable JSON file, loaded once at startup and rewritten
//! atomically after each mutation. A corrupted file aborts startup; there is
//! no silent recovery path.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::Task;

use super::messages::StoreError;

/// Schema version of the store file
const STORE_VERSION: u32 = 1;

/// On-disk shape of the store file
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    tasks: Vec<Task>,
}

/// Load the store file into an id-keyed index.
///
/// A missing file is an empty store. Anything unparseable, a duplicate id, or
/// an unexpected schema version is `Corrupt`.
pub fn load(path: &Path) -> Result<HashMap<String, Task>, StoreError> {
    if !path.exists() {
        debug!(path = %path.display(), "store file absent, starting empty");
        return Ok(HashMap::new());
    }

    let content = fs::read_to_string(path).map_err(|e| StoreError::Io(e.to_string()))?;
    let file: StoreFile =
        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))?;

    if file.version != STORE_VERSION {
        return Err(StoreError::Corrupt(format!(
            "{}: unsupported store version {}",
            path.display(),
            file.version
        )));
    }

    let mut index = HashMap::with_capacity(file.tasks.len());
    for task in file.tasks {
        let id = task.id.clone();
        if index.insert(id.clone(), task).is_some() {
            return Err(StoreError::Corrupt(format!("duplicate task id in {}: {}", path.display(), id)));
        }
    }

    info!(path = %path.display(), count = index.len(), "Loaded task store");
    Ok(index)
}

/// Write the store file atomically (tempfile in the same directory, then
/// rename).
pub fn save(path: &Path, index: &HashMap<String, Task>) -> Result<(), StoreError> {
    let mut tasks: Vec<Task> = index.values().cloned().collect();
    // Stable on-disk ordering keeps diffs readable
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let file = StoreFile {
        version: STORE_VERSION,
        tasks,
    };
    let json = serde_json::to_string_pretty(&file).map_err(|e| StoreError::Io(e.to_string()))?;

    let dir = path.parent().ok_or_else(|| StoreError::Io("store path has no parent".to_string()))?;
    fs::create_dir_all(dir).map_err(|e| StoreError::Io(e.to_string()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::Io(e.to_string()))?;
    tmp.write_all(json.as_bytes()).map_err(|e| StoreError::Io(e.to_string()))?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.to_string()))?;

    debug!(path = %path.display(), count = index.len(), "Flushed task store");
    Ok(())
}
