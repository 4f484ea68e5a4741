//! Engine event vocabulary and the EventSink port
//!
//! Terminal events flow to an [`EventSink`]; notification transports
//! (webhooks, email) plug in behind it and are not part of the engine.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::ErrorKind;

/// Observable engine events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    TaskStarted {
        task_id: String,
        executor_id: usize,
        attempt: u32,
    },
    TaskCompleted {
        task_id: String,
        tokens_used: u64,
    },
    TaskFailed {
        task_id: String,
        kind: ErrorKind,
        message: String,
    },
    TaskBlocked {
        task_id: String,
        failed_dep: String,
    },
    TaskRestored {
        task_id: String,
        checkpoint_id: String,
    },
    BudgetWarning {
        used: u64,
        limit: u64,
    },
    BudgetExhausted {
        used: u64,
        limit: u64,
    },
    ReviewStarted {
        round: u32,
    },
    ReviewEmitted {
        round: u32,
        new_tasks: usize,
    },
    Shutdown {
        outcome: String,
    },
}

impl EngineEvent {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskStarted { .. } => "TaskStarted",
            Self::TaskCompleted { .. } => "TaskCompleted",
            Self::TaskFailed { .. } => "TaskFailed",
            Self::TaskBlocked { .. } => "TaskBlocked",
            Self::TaskRestored { .. } => "TaskRestored",
            Self::BudgetWarning { .. } => "BudgetWarning",
            Self::BudgetExhausted { .. } => "BudgetExhausted",
            Self::ReviewStarted { .. } => "ReviewStarted",
            Self::ReviewEmitted { .. } => "ReviewEmitted",
            Self::Shutdown { .. } => "Shutdown",
        }
    }
}

/// Port for terminal event delivery
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &EngineEvent);
}

/// Discards everything
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &EngineEvent) {}
}

/// Logs events through tracing
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &EngineEvent) {
        match event {
            EngineEvent::TaskFailed { task_id, kind, message } => {
                warn!(task_id = %task_id, kind = %kind, message = %message, "task failed");
            }
            EngineEvent::BudgetWarning { used, limit } | EngineEvent::BudgetExhausted { used, limit } => {
                warn!(used, limit, event = event.event_type(), "budget event");
            }
            other => {
                info!(event = other.event_type(), detail = ?other, "engine event");
            }
        }
    }
}

/// Captures events for test assertions
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: &EngineEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        let event = EngineEvent::BudgetWarning { used: 900, limit: 1000 };
        assert_eq!(event.event_type(), "BudgetWarning");
    }

    #[test]
    fn test_event_serde() {
        let event = EngineEvent::TaskFailed {
            task_id: "t-1".to_string(),
            kind: ErrorKind::Transient,
            message: "timeout".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("TaskFailed"));
        assert!(json.contains("transient"));

        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), "TaskFailed");
    }

    #[test]
    fn test_capture_sink() {
        let sink = CaptureSink::new();
        sink.emit(&EngineEvent::Shutdown {
            outcome: "completed".to_string(),
        });
        sink.emit(&EngineEvent::BudgetWarning { used: 1, limit: 2 });

        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.count_of("Shutdown"), 1);
        assert_eq!(sink.count_of("BudgetWarning"), 1);
    }
}
