//! Usage-budget governor
//!
//! Tracks cumulative tokens reported by the tool and gates new dispatches
//! before a configured quota is exhausted. Whatever the tool reports is
//! authoritative; the engine never re-derives token counts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::now_ms;

/// How budget refusals are enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Refuse dispatches that would cross the limit
    #[default]
    Strict,
    /// Admit but warn
    Soft,
}

/// Budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BudgetConfig {
    /// Total token quota for the run; 0 disables enforcement
    pub total_limit: u64,
    /// Expected tokens per invocation; used as the admission estimate
    pub per_task_limit: u64,
    /// Percentage of the total at which a warning fires (0-100)
    pub warning_threshold: u8,
    pub enforcement_mode: EnforcementMode,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total_limit: 0,
            per_task_limit: 0,
            warning_threshold: 80,
            enforcement_mode: EnforcementMode::Strict,
        }
    }
}

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Soft mode admitted a dispatch that crosses the limit
    GrantedOverLimit,
    Refused,
}

/// Persisted usage snapshot
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BudgetSnapshot {
    pub tokens_used: u64,
    pub per_task: HashMap<String, u64>,
    /// Unix millis when this accounting window started
    pub started_at: i64,
}

struct BudgetInner {
    tokens_used: u64,
    per_task: HashMap<String, u64>,
    started_at: i64,
    completed_invocations: u64,
    warning_emitted: bool,
}

/// Process-wide admission controller for the token quota
pub struct BudgetGovernor {
    config: BudgetConfig,
    inner: Mutex<BudgetInner>,
    snapshot_path: Option<PathBuf>,
}

impl BudgetGovernor {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BudgetInner {
                tokens_used: 0,
                per_task: HashMap::new(),
                started_at: now_ms(),
                completed_invocations: 0,
                warning_emitted: false,
            }),
            snapshot_path: None,
        }
    }

    /// Reload any prior snapshot so a resumed run continues against the same
    /// quota window. Missing or unreadable snapshots start fresh.
    pub fn with_snapshot(config: BudgetConfig, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut governor = Self::new(config);

        if let Ok(content) = std::fs::read_to_string(&path)
            && let Ok(snapshot) = serde_json::from_str::<BudgetSnapshot>(&content)
        {
            let inner = governor.inner.get_mut();
            inner.tokens_used = snapshot.tokens_used;
            inner.completed_invocations = snapshot.per_task.len() as u64;
            inner.per_task = snapshot.per_task;
            inner.started_at = snapshot.started_at;
            info!(tokens_used = inner.tokens_used, "Reloaded budget snapshot");
        }

        governor.snapshot_path = Some(path);
        governor
    }

    /// Estimate for the next dispatch: the per-task limit when configured,
    /// otherwise the running average of observed usage.
    async fn estimate(&self) -> u64 {
        if self.config.per_task_limit > 0 {
            return self.config.per_task_limit;
        }
        let inner = self.inner.lock().await;
        if inner.completed_invocations == 0 {
            0
        } else {
            inner.tokens_used / inner.completed_invocations
        }
    }

    /// Admission check, called before each dispatch.
    ///
    /// Returns the decision plus whether this call crossed the warning
    /// threshold (at most once per run).
    pub async fn admit(&self) -> (Admission, bool) {
        if self.config.total_limit == 0 {
            return (Admission::Granted, false);
        }

        let estimate = self.estimate().await;
        let mut inner = self.inner.lock().await;

        let crossed_warning = self.check_warning(&mut inner);

        if inner.tokens_used + estimate > self.config.total_limit {
            match self.config.enforcement_mode {
                EnforcementMode::Strict => {
                    debug!(
                        used = inner.tokens_used,
                        estimate,
                        limit = self.config.total_limit,
                        "budget refused dispatch"
                    );
                    (Admission::Refused, crossed_warning)
                }
                EnforcementMode::Soft => {
                    warn!(
                        used = inner.tokens_used,
                        estimate,
                        limit = self.config.total_limit,
                        "budget limit crossed in soft mode"
                    );
                    (Admission::GrantedOverLimit, crossed_warning)
                }
            }
        } else {
            (Admission::Granted, crossed_warning)
        }
    }

    fn check_warning(&self, inner: &mut BudgetInner) -> bool {
        if inner.warning_emitted || self.config.total_limit == 0 || self.config.warning_threshold == 0 {
            return false;
        }
        let threshold = self.config.total_limit * self.config.warning_threshold as u64 / 100;
        if inner.tokens_used >= threshold {
            inner.warning_emitted = true;
            true
        } else {
            false
        }
    }

    /// Record usage after a successful invocation. Returns true when this
    /// recording crossed the warning threshold (at most once per run).
    pub async fn record(&self, task_id: &str, tokens: u64) -> bool {
        let mut inner = self.inner.lock().await;
        inner.tokens_used += tokens;
        *inner.per_task.entry(task_id.to_string()).or_insert(0) += tokens;
        inner.completed_invocations += 1;
        debug!(task_id = %task_id, tokens, total = inner.tokens_used, "recorded token usage");
        self.check_warning(&mut inner)
    }

    /// Cumulative tokens used
    pub async fn tokens_used(&self) -> u64 {
        self.inner.lock().await.tokens_used
    }

    pub fn total_limit(&self) -> u64 {
        self.config.total_limit
    }

    /// Current usage snapshot
    pub async fn snapshot(&self) -> BudgetSnapshot {
        let inner = self.inner.lock().await;
        BudgetSnapshot {
            tokens_used: inner.tokens_used,
            per_task: inner.per_task.clone(),
            started_at: inner.started_at,
        }
    }

    /// Persist the snapshot (called at shutdown)
    pub async fn persist(&self) -> eyre::Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let snapshot = self.snapshot().await;
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), "persisted budget snapshot");
        Ok(())
    }
}
