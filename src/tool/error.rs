//! Tool invocation errors

use std::time::Duration;

use thiserror::Error;

use crate::domain::ErrorKind;

/// Errors from driving the external tool
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to spawn tool process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Tool timed out after {0:?}")]
    Timeout(Duration),

    #[error("Tool exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    #[error("Tool output violated the contract: {0}")]
    Protocol(String),

    #[error("Invocation cancelled")]
    Cancelled,
}

impl ToolError {
    /// Map into the engine's error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Spawn(_) | Self::Timeout(_) | Self::Failed { .. } => ErrorKind::Transient,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}
