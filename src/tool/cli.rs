//! Subprocess tool client
//!
//! Spawns the configured command once per invocation with the working
//! directory as its argument, the prompt on stdin, and the API credential in
//! the environment. Stdout is parsed against the output contract. Timeouts
//! and cancellation terminate the child: SIGTERM, a 5 second grace period,
//! then SIGKILL.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::output::ToolOutput;
use super::{ToolClient, ToolError, ToolRequest};

/// Grace period between SIGTERM and SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Drives the external LLM tool as a child process
pub struct CliTool {
    command: String,
    /// Credential variable name and its value, read once at startup
    credential: (String, String),
}

impl CliTool {
    /// Create a client, reading and validating the API credential from the
    /// engine's own environment.
    pub fn new(command: impl Into<String>, api_key_env: &str) -> eyre::Result<Self> {
        let value = std::env::var(api_key_env)
            .map_err(|_| eyre::eyre!("Environment variable {} is not set", api_key_env))?;
        if value.trim().len() < 8 {
            return Err(eyre::eyre!("Environment variable {} looks too short to be a credential", api_key_env));
        }
        Ok(Self {
            command: command.into(),
            credential: (api_key_env.to_string(), value),
        })
    }

    /// Terminate the child: SIGTERM, wait out the grace period, then SIGKILL.
    async fn terminate(child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(_) => debug!("tool process exited after terminate"),
            Err(_) => {
                warn!("tool process ignored terminate, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}

#[async_trait]
impl ToolClient for CliTool {
    async fn invoke(&self, request: ToolRequest, cancel: CancellationToken) -> Result<ToolOutput, ToolError> {
        debug!(task_id = %request.task_id, command = %self.command, "invoking tool");

        let mut child = Command::new(&self.command)
            .arg(&request.workdir)
            .env(&self.credential.0, &self.credential.1)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Deliver the prompt and close stdin so the tool sees EOF
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");
        let reader = tokio::spawn(async move {
            let mut stdout = String::new();
            let mut stderr = String::new();
            let _ = stdout_pipe.read_to_string(&mut stdout).await;
            let _ = stderr_pipe.read_to_string(&mut stderr).await;
            (stdout, stderr)
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = tokio::time::sleep(request.timeout) => {
                Self::terminate(&mut child).await;
                reader.abort();
                return Err(ToolError::Timeout(request.timeout));
            }
            _ = cancel.cancelled() => {
                Self::terminate(&mut child).await;
                reader.abort();
                return Err(ToolError::Cancelled);
            }
        };

        let (stdout, stderr) = reader.await.unwrap_or_default();

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            debug!(task_id = %request.task_id, code, "tool exited non-zero");
            return Err(ToolError::Failed {
                code,
                stderr: stderr.lines().take(10).collect::<Vec<_>>().join("\n"),
            });
        }

        ToolOutput::parse(&stdout)
    }
}
