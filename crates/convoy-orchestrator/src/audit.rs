// Audit Gate
// Verifies completion claims and enforces the per-session retry bound

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use convoy_providers::{CompletionRequest, CompletionService, ProviderError};
use convoy_types::{ChatMessage, Todo};

use crate::budget::BudgetGuard;
use crate::config::{OrchestratorConfig, PricingConfig, VerifierKind};
use crate::error::{OrchestratorError, Result};
use crate::prompts::{build_verifier_prompt, parse_verdict, VerifierReport};
use crate::types::{AuditRecord, AuditScope, Verdict};

const MAX_ISSUE_CHARS: usize = 2000;

/// Everything a verifier may look at for one claim.
pub struct AuditRequest<'a> {
    pub agent_id: &'a str,
    pub scope: &'a AuditScope,
    pub todos: &'a [Todo],
    pub touched_paths: &'a [PathBuf],
    pub claim: &'a str,
    /// Directory checks run in (the partition's primary root).
    pub workdir: &'a Path,
    /// Model-backed checks charge their calls here when present.
    pub budget: Option<&'a BudgetGuard>,
}

#[async_trait]
pub trait Verifier: Send + Sync {
    fn name(&self) -> &str;

    async fn verify(
        &self,
        request: &AuditRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<VerifierReport>;
}

// ============================================================================
// Model verifier
// ============================================================================

/// Second reasoning pass over the claim using the same completion service.
pub struct ModelVerifier {
    provider: Arc<dyn CompletionService>,
    pricing: PricingConfig,
    max_output_tokens: u32,
}

impl ModelVerifier {
    pub fn new(provider: Arc<dyn CompletionService>, pricing: PricingConfig, max_output_tokens: u32) -> Self {
        Self {
            provider,
            pricing,
            max_output_tokens,
        }
    }

    /// Provider routing scope for audits of a partition.
    pub fn scope_for(partition_id: &str) -> String {
        format!("audit:{}", partition_id)
    }
}

#[async_trait]
impl Verifier for ModelVerifier {
    fn name(&self) -> &str {
        "model"
    }

    async fn verify(
        &self,
        request: &AuditRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<VerifierReport> {
        let prompt = build_verifier_prompt(
            request.scope,
            request.todos,
            request.touched_paths,
            request.claim,
        );
        let completion = CompletionRequest {
            agent_id: format!("{}-verifier", request.agent_id),
            scope: Self::scope_for(&request.scope.partition_id),
            system_prompt: "You verify work done by other agents. Be specific and strict.".to_string(),
            messages: vec![ChatMessage::user(prompt)],
            tools: Vec::new(),
            max_output_tokens: self.max_output_tokens,
        };

        let estimate = self
            .pricing
            .estimate(completion.estimated_prompt_tokens(), self.max_output_tokens);
        let reservation = match request.budget {
            Some(guard) => tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(OrchestratorError::Cancelled(
                        "verification cancelled while waiting for budget".to_string(),
                    ));
                }
                reserved = guard.reserve(estimate) => Some(reserved?),
            },
            None => None,
        };

        let response = match self.provider.complete(completion, cancel).await {
            Ok(response) => response,
            Err(err) => {
                if let (Some(guard), Some(reservation)) = (request.budget, reservation) {
                    guard.release(reservation);
                }
                return Err(match err {
                    ProviderError::Cancelled => {
                        OrchestratorError::Cancelled("verification call cancelled".to_string())
                    }
                    other => other.into(),
                });
            }
        };

        if let (Some(guard), Some(reservation)) = (request.budget, reservation) {
            let actual = response
                .cost
                .or_else(|| response.usage.map(|u| self.pricing.cost_for(&u)))
                .unwrap_or(estimate);
            guard.commit(reservation, actual)?;
        }

        Ok(parse_verdict(&response.text).unwrap_or_else(|| VerifierReport {
            verdict: Verdict::Fail,
            issues: vec!["verifier output could not be interpreted".to_string()],
        }))
    }
}

// ============================================================================
// Command verifier
// ============================================================================

/// Runs a shell check (tests, linters) in the partition root. Exit 0 passes.
pub struct CommandVerifier {
    command: String,
    timeout: Duration,
}

impl CommandVerifier {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

fn output_tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.trim().to_string();
    }
    text.chars().skip(count - max_chars).collect::<String>().trim().to_string()
}

#[async_trait]
impl Verifier for CommandVerifier {
    fn name(&self) -> &str {
        "command"
    }

    async fn verify(
        &self,
        request: &AuditRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<VerifierReport> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OrchestratorError::ToolExecution(format!("failed to spawn check `{}`: {}", self.command, e))
            })?;

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(OrchestratorError::Cancelled("check cancelled".to_string()));
            }
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(output) => output?,
                Err(_) => {
                    return Ok(VerifierReport {
                        verdict: Verdict::Fail,
                        issues: vec![format!(
                            "check `{}` timed out after {}s",
                            self.command,
                            self.timeout.as_secs()
                        )],
                    });
                }
            },
        };

        if output.status.success() {
            return Ok(VerifierReport {
                verdict: Verdict::Pass,
                issues: Vec::new(),
            });
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let mut issues = vec![format!(
            "check `{}` exited with {}",
            self.command,
            output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "a signal".to_string())
        )];
        let tail = output_tail(&combined, MAX_ISSUE_CHARS);
        if !tail.is_empty() {
            issues.push(tail);
        }
        Ok(VerifierReport {
            verdict: Verdict::Fail,
            issues,
        })
    }
}

// ============================================================================
// Chain verifier
// ============================================================================

/// Runs verifiers in order; the first non-pass report wins.
pub struct ChainVerifier {
    verifiers: Vec<Arc<dyn Verifier>>,
}

impl ChainVerifier {
    pub fn new(verifiers: Vec<Arc<dyn Verifier>>) -> Self {
        Self { verifiers }
    }
}

#[async_trait]
impl Verifier for ChainVerifier {
    fn name(&self) -> &str {
        "chain"
    }

    async fn verify(
        &self,
        request: &AuditRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<VerifierReport> {
        for verifier in &self.verifiers {
            let report = verifier.verify(request, cancel.clone()).await?;
            if report.verdict != Verdict::Pass {
                tracing::debug!(verifier = verifier.name(), verdict = report.verdict.as_str(), "chain stopped");
                return Ok(report);
            }
        }
        Ok(VerifierReport {
            verdict: Verdict::Pass,
            issues: Vec::new(),
        })
    }
}

/// Builds the verifier the configuration asks for. `chain` runs the check
/// command first and only asks the model when it passes.
pub fn verifier_from_config(
    config: &OrchestratorConfig,
    provider: Arc<dyn CompletionService>,
) -> Result<Arc<dyn Verifier>> {
    let model = || -> Arc<dyn Verifier> {
        Arc::new(ModelVerifier::new(
            provider.clone(),
            config.pricing,
            config.max_output_tokens,
        ))
    };
    let command = || -> Result<Arc<dyn Verifier>> {
        let check = config.verifier.check_command.clone().ok_or_else(|| {
            OrchestratorError::Config("verifier needs a check_command".to_string())
        })?;
        Ok(Arc::new(CommandVerifier::new(
            check,
            Duration::from_secs(config.command_timeout_secs),
        )))
    };
    Ok(match config.verifier.kind {
        VerifierKind::Model => model(),
        VerifierKind::Command => command()?,
        VerifierKind::Chain => Arc::new(ChainVerifier::new(vec![command()?, model()])),
    })
}

// ============================================================================
// Gate
// ============================================================================

/// Wraps a verifier with the retry bound. The gate, not the verifier, owns
/// the count of fail verdicts per session.
pub struct AuditGate {
    verifier: Arc<dyn Verifier>,
    retry_limit: u32,
    retries: Mutex<HashMap<String, u32>>,
}

impl AuditGate {
    pub fn new(verifier: Arc<dyn Verifier>, retry_limit: u32) -> Self {
        Self {
            verifier,
            retry_limit,
            retries: Mutex::new(HashMap::new()),
        }
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Restores a session's count from a snapshot.
    pub fn seed(&self, agent_id: &str, retry_count: u32) {
        if let Ok(mut retries) = self.retries.lock() {
            retries.insert(agent_id.to_string(), retry_count);
        }
    }

    pub fn retry_count(&self, agent_id: &str) -> u32 {
        self.retries
            .lock()
            .ok()
            .and_then(|r| r.get(agent_id).copied())
            .unwrap_or(0)
    }

    fn record_retry(&self, agent_id: &str) -> u32 {
        match self.retries.lock() {
            Ok(mut retries) => {
                let count = retries.entry(agent_id.to_string()).or_insert(0);
                *count += 1;
                *count
            }
            Err(_) => self.retry_limit,
        }
    }

    /// Runs the verifier and applies the bound: once `retry_limit` fail
    /// verdicts have been handed back, the next non-pass is `escalate`.
    /// Verifier errors count as a fail; budget errors and cancellation
    /// propagate without using up a retry.
    pub async fn evaluate(
        &self,
        request: &AuditRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<AuditRecord> {
        let report = match self.verifier.verify(request, cancel.clone()).await {
            Ok(report) => report,
            Err(OrchestratorError::BudgetExceeded(err)) => return Err(err.into()),
            Err(err @ OrchestratorError::Cancelled(_)) => return Err(err),
            Err(err) if cancel.is_cancelled() => {
                return Err(OrchestratorError::Cancelled(format!(
                    "verification cancelled: {}",
                    err
                )))
            }
            Err(err) => {
                tracing::warn!(
                    agent_id = request.agent_id,
                    verifier = self.verifier.name(),
                    error = %err,
                    "verifier failed; treating as a fail verdict"
                );
                VerifierReport {
                    verdict: Verdict::Fail,
                    issues: vec![format!("verification could not run: {}", err)],
                }
            }
        };

        let used = self.retry_count(request.agent_id);
        let (verdict, retry_count) = match report.verdict {
            Verdict::Pass => (Verdict::Pass, used),
            Verdict::Escalate => (Verdict::Escalate, used),
            Verdict::Fail if used >= self.retry_limit => (Verdict::Escalate, used),
            Verdict::Fail => (Verdict::Fail, self.record_retry(request.agent_id)),
        };

        let mut issues = report.issues;
        if verdict == Verdict::Escalate && report.verdict == Verdict::Fail {
            issues.push(format!("retry limit of {} reached", self.retry_limit));
        }

        Ok(AuditRecord {
            agent_id: request.agent_id.to_string(),
            scope: request.scope.clone(),
            verdict,
            issues,
            retry_count,
            created_at: Utc::now(),
        })
    }
}
