// Process Provider
// Completion bridge that speaks JSON over a child process's stdin and stdout

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{CompletionRequest, CompletionResponse, CompletionService, ProviderError};

/// Exit status a bridge uses to ask for a retry (EX_TEMPFAIL).
pub const TEMPFAIL_EXIT_CODE: i32 = 75;

fn default_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessProviderConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Bridges to any model backend through a child process: the request is
/// written to stdin as JSON and a `CompletionResponse` is read from stdout.
pub struct ProcessProvider {
    config: ProcessProviderConfig,
    working_dir: PathBuf,
}

impl ProcessProvider {
    pub fn new(config: ProcessProviderConfig, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            working_dir: working_dir.into(),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs.max(1))
    }
}

#[async_trait]
impl CompletionService for ProcessProvider {
    fn name(&self) -> &str {
        &self.config.command
    }

    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionResponse, ProviderError> {
        let payload = serde_json::to_vec(&request)
            .map_err(|e| ProviderError::Fatal(format!("failed to encode request: {}", e)))?;

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            ProviderError::Fatal(format!("failed to spawn `{}`: {}", self.config.command, e))
        })?;

        // The request is fed while stdout is drained, all under the timeout, so
        // a bridge that never reads its input cannot wedge the call.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&payload).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };
        let exchange = async move {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed.map_err(|e| ProviderError::Transient(format!("failed to write request: {}", e)))?;
            output.map_err(|e| ProviderError::Transient(format!("bridge process failed: {}", e)))
        };

        let timeout = self.timeout();
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            result = tokio::time::timeout(timeout, exchange) => match result {
                Err(_) => return Err(ProviderError::Timeout(timeout)),
                Ok(output) => output?,
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr_tail(&stderr);
            tracing::warn!(
                command = %self.config.command,
                status = %output.status,
                "completion bridge exited unsuccessfully"
            );
            return Err(match output.status.code() {
                Some(TEMPFAIL_EXIT_CODE) => ProviderError::Transient(tail),
                _ => ProviderError::Fatal(format!("bridge exited with {}: {}", output.status, tail)),
            });
        }

        serde_json::from_slice::<CompletionResponse>(&output.stdout).map_err(|e| {
            ProviderError::Fatal(format!("bridge returned invalid response JSON: {}", e))
        })
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(499)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    trimmed[start..].to_string()
}
