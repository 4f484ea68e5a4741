//! Checkpoint domain type
//!
//! A durable per-step snapshot of a task's execution context. Checkpoints
//! are created by executors and consumed by the resume protocol after a
//! restart.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::now_ms;

/// Checkpoint lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Created,
    Active,
    Completed,
    Failed,
    Restored,
}

impl CheckpointState {
    /// The permitted-transition set. Everything else is rejected by the
    /// checkpoint store.
    pub fn can_transition(from: CheckpointState, to: CheckpointState) -> bool {
        use CheckpointState::*;
        matches!(
            (from, to),
            (Created, Active) | (Active, Completed) | (Active, Failed) | (Failed, Restored) | (Restored, Active)
        )
    }

    /// Completed checkpoints are excluded from resume lookups
    pub fn is_resumable(&self) -> bool {
        !matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Restored => write!(f, "restored"),
        }
    }
}

/// A durable snapshot of one step of a task's execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// `cp_{task_id}_{step}_{created_at}`
    pub id: String,

    /// Owning task
    pub task_id: String,

    /// 1-based step number
    pub step_number: u32,

    /// Total steps, when known up front
    #[serde(default)]
    pub total_steps: Option<u32>,

    /// Human-readable step description
    pub description: String,

    /// Lifecycle state
    pub state: CheckpointState,

    /// Opaque payload captured by the executor
    #[serde(default)]
    pub data: serde_json::Value,

    /// sha256 over the canonical record with this field blanked
    #[serde(default)]
    pub checksum: String,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,

    /// Previous checkpoint in the chain, if any
    #[serde(default)]
    pub parent: Option<String>,
}

impl Checkpoint {
    /// Create a new checkpoint in `Created` state
    pub fn new(task_id: impl Into<String>, step_number: u32, description: impl Into<String>) -> Self {
        let task_id = task_id.into();
        let now = now_ms();
        let mut cp = Self {
            id: format!("cp_{}_{}_{}", task_id, step_number, now),
            task_id,
            step_number,
            total_steps: None,
            description: description.into(),
            state: CheckpointState::Created,
            data: serde_json::Value::Null,
            checksum: String::new(),
            created_at: now,
            updated_at: now,
            parent: None,
        };
        cp.reseal();
        cp
    }

    /// Builder method to set the payload
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self.reseal();
        self
    }

    /// Builder method to link the previous checkpoint
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self.reseal();
        self
    }

    /// Builder method to set the total step count
    pub fn with_total_steps(mut self, total: u32) -> Self {
        self.total_steps = Some(total);
        self.reseal();
        self
    }

    /// Compute the content checksum over the record with the checksum field
    /// blanked
    pub fn compute_checksum(&self) -> String {
        let mut blank = self.clone();
        blank.checksum = String::new();
        // serde_json ordering is stable for a struct, so the digest is too
        let bytes = serde_json::to_vec(&blank).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        hex::encode(digest)
    }

    /// Recompute and store the checksum after a mutation
    pub fn reseal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Verify the stored checksum against the content
    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Apply a state transition, resealing on success
    pub fn transition(&mut self, to: CheckpointState) -> bool {
        if !CheckpointState::can_transition(self.state, to) {
            return false;
        }
        self.state = to;
        self.updated_at = now_ms();
        self.reseal();
        true
    }

    /// Merge new payload data and touch the record
    pub fn set_data(&mut self, data: serde_json::Value) {
        self.data = data;
        self.updated_at = now_ms();
        self.reseal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkpoint_id_format() {
        let cp = Checkpoint::new("task-7", 2, "invoke");
        assert!(cp.id.starts_with("cp_task-7_2_"));
        assert_eq!(cp.step_number, 2);
        assert_eq!(cp.state, CheckpointState::Created);
    }

    #[test]
    fn test_permitted_state_transitions() {
        use CheckpointState::*;
        assert!(CheckpointState::can_transition(Created, Active));
        assert!(CheckpointState::can_transition(Active, Completed));
        assert!(CheckpointState::can_transition(Active, Failed));
        assert!(CheckpointState::can_transition(Failed, Restored));
        assert!(CheckpointState::can_transition(Restored, Active));
    }

    #[test]
    fn test_disallowed_state_transitions() {
        use CheckpointState::*;
        assert!(!CheckpointState::can_transition(Created, Completed));
        assert!(!CheckpointState::can_transition(Completed, Active));
        assert!(!CheckpointState::can_transition(Failed, Active));
        assert!(!CheckpointState::can_transition(Created, Restored));
        assert!(!CheckpointState::can_transition(Completed, Failed));
    }

    #[test]
    fn test_transition_reseals() {
        let mut cp = Checkpoint::new("task-1", 1, "invoke");
        assert!(cp.verify());

        assert!(cp.transition(CheckpointState::Active));
        assert_eq!(cp.state, CheckpointState::Active);
        assert!(cp.verify());

        // Disallowed transition leaves the record untouched
        assert!(!cp.transition(CheckpointState::Restored));
        assert_eq!(cp.state, CheckpointState::Active);
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let mut cp = Checkpoint::new("task-1", 1, "invoke").with_data(json!({"attempt": 1}));
        assert!(cp.verify());

        cp.data = json!({"attempt": 99});
        assert!(!cp.verify());

        cp.reseal();
        assert!(cp.verify());
    }

    #[test]
    fn test_checkpoint_serde_round_trip() {
        let cp = Checkpoint::new("task-1", 1, "invoke")
            .with_data(json!({"attempt": 1}))
            .with_total_steps(3);

        let json = serde_json::to_string(&cp).unwrap();
        let parsed: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(cp, parsed);
        assert!(parsed.verify());
    }
}
