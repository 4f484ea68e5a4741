//! Scripted tool double
//!
//! Returns canned outputs per task id, in order, for deterministic tests.
//! Lives outside `#[cfg(test)]` so integration tests can drive the whole
//! engine with it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::output::ToolOutput;
use super::{ToolClient, ToolError, ToolRequest};

/// One canned reaction to an invocation
pub enum Scripted {
    /// Return this output
    Ok(ToolOutput),
    /// Fail with this error
    Err(ToolError),
    /// Sleep, then return this output (exercises timeouts and cancellation)
    SlowOk(Duration, ToolOutput),
}

/// Deterministic [`ToolClient`] for tests
#[derive(Default)]
pub struct ScriptedTool {
    scripts: Mutex<HashMap<String, Vec<Scripted>>>,
    /// Every invocation in arrival order (task id)
    invocations: Mutex<Vec<String>>,
}

impl ScriptedTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reaction for a task id; reactions are consumed in order and
    /// the last one repeats.
    pub fn script(&self, task_id: impl Into<String>, reaction: Scripted) {
        self.scripts.lock().unwrap().entry(task_id.into()).or_default().push(reaction);
    }

    /// Convenience: a successful output with the given token count
    pub fn script_success(&self, task_id: impl Into<String>, tokens_used: u64) {
        self.script(
            task_id,
            Scripted::Ok(ToolOutput {
                text: "done".to_string(),
                tokens_used,
                ..Default::default()
            }),
        );
    }

    /// Task ids in invocation order
    pub fn invocations(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }

    /// Invocation count for one task id
    pub fn invocation_count(&self, task_id: &str) -> usize {
        self.invocations.lock().unwrap().iter().filter(|id| *id == task_id).count()
    }

    fn next_reaction(&self, task_id: &str) -> Option<Scripted> {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.get_mut(task_id)?;
        if queue.is_empty() {
            return None;
        }
        if queue.len() == 1 {
            // Last reaction repeats so retries stay scripted
            Some(match &queue[0] {
                Scripted::Ok(out) => Scripted::Ok(out.clone()),
                Scripted::Err(err) => Scripted::Err(clone_error(err)),
                Scripted::SlowOk(delay, out) => Scripted::SlowOk(*delay, out.clone()),
            })
        } else {
            Some(queue.remove(0))
        }
    }
}

fn clone_error(err: &ToolError) -> ToolError {
    match err {
        ToolError::Spawn(e) => ToolError::Spawn(std::io::Error::new(e.kind(), e.to_string())),
        ToolError::Timeout(d) => ToolError::Timeout(*d),
        ToolError::Failed { code, stderr } => ToolError::Failed {
            code: *code,
            stderr: stderr.clone(),
        },
        ToolError::Protocol(msg) => ToolError::Protocol(msg.clone()),
        ToolError::Cancelled => ToolError::Cancelled,
    }
}

#[async_trait]
impl ToolClient for ScriptedTool {
    async fn invoke(&self, request: ToolRequest, cancel: CancellationToken) -> Result<ToolOutput, ToolError> {
        self.invocations.lock().unwrap().push(request.task_id.clone());

        match self.next_reaction(&request.task_id) {
            Some(Scripted::Ok(out)) => Ok(out),
            Some(Scripted::Err(err)) => Err(err),
            Some(Scripted::SlowOk(delay, out)) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(out),
                    _ = tokio::time::sleep(request.timeout) => Err(ToolError::Timeout(request.timeout)),
                    _ = cancel.cancelled() => Err(ToolError::Cancelled),
                }
            }
            None => Err(ToolError::Protocol(format!("no script for task {}", request.task_id))),
        }
    }
}
