//! External tool port
//!
//! The LLM command-line tool is reached through the [`ToolClient`] trait: a
//! subprocess implementation for production and a scripted double for tests.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

mod cli;
mod error;
mod output;
pub mod scripted;

pub use cli::CliTool;
pub use error::ToolError;
pub use output::{NewTask, ToolOutput};
pub use scripted::ScriptedTool;

/// One invocation of the external tool
#[derive(Debug, Clone)]
pub struct ToolRequest {
    /// Task driving this invocation ("review" for the review pass)
    pub task_id: String,
    /// Composed prompt, delivered on stdin
    pub prompt: String,
    /// Working directory handed to the tool
    pub workdir: PathBuf,
    /// Per-invocation wall-clock limit
    pub timeout: Duration,
}

/// Port to the external LLM tool
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Invoke the tool once. The invocation is a scoped resource: on
    /// timeout or cancellation the child process is terminated, never
    /// orphaned.
    async fn invoke(&self, request: ToolRequest, cancel: CancellationToken) -> Result<ToolOutput, ToolError>;
}
