// Orchestrator Configuration
// Run limits, pricing, scopes and collaborator settings, loaded once per run

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use convoy_providers::ProcessProviderConfig;
use convoy_types::TokenUsage;

use crate::error::{OrchestratorError, Result};

// ============================================================================
// Pricing
// ============================================================================

/// Dollar prices per million tokens, used to reserve before a call and to
/// price usage when the provider reports no cost.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PricingConfig {
    #[serde(default = "default_input_per_mtok")]
    pub input_per_mtok: f64,
    #[serde(default = "default_output_per_mtok")]
    pub output_per_mtok: f64,
}

fn default_input_per_mtok() -> f64 {
    3.0
}

fn default_output_per_mtok() -> f64 {
    15.0
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_mtok: default_input_per_mtok(),
            output_per_mtok: default_output_per_mtok(),
        }
    }
}

impl PricingConfig {
    pub fn estimate(&self, prompt_tokens: u64, max_output_tokens: u32) -> f64 {
        (prompt_tokens as f64 * self.input_per_mtok
            + max_output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }

    pub fn cost_for(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 * self.input_per_mtok
            + usage.completion_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

// ============================================================================
// Verifier
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerifierKind {
    #[default]
    Model,
    Command,
    /// Command check first, then the model review.
    Chain,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VerifierConfig {
    #[serde(default)]
    pub kind: VerifierKind,
    /// Shell command run in the partition root; non-zero exit fails the audit.
    #[serde(default)]
    pub check_command: Option<String>,
}

// ============================================================================
// Orchestrator Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Whole-run cost cap in dollars
    #[serde(default = "default_max_cost")]
    pub max_cost: f64,
    /// Whole-run cap on reasoning-loop iterations across all sessions
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Audit fail -> retry cycles allowed per session
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Retryable tool failures tolerated per session
    #[serde(default = "default_tool_retry_limit")]
    pub tool_retry_limit: u32,
    #[serde(default = "default_provider_retry_limit")]
    pub provider_retry_limit: u32,
    #[serde(default = "default_provider_backoff_ms")]
    pub provider_backoff_ms: u64,
    #[serde(default)]
    pub max_session_cost: Option<f64>,
    #[serde(default = "default_max_session_iterations")]
    pub max_session_iterations: u32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_handoff_max_chars")]
    pub handoff_max_chars: usize,
    /// Category -> allowed paths, relative to the workspace.
    #[serde(default)]
    pub scopes: BTreeMap<String, Vec<PathBuf>>,
    /// Narrows the role's default tool preset; never widens it.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    /// Grants `run_command` to single and sequential sessions. Parallel
    /// workers never get it: a shell is not confined to a partition's paths.
    #[serde(default)]
    pub allow_commands: bool,
    /// Category slugs whose partitions run as read-only supervisor sessions.
    #[serde(default)]
    pub review_categories: Vec<String>,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub provider: Option<ProcessProviderConfig>,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_todo_file")]
    pub todo_file: String,
}

fn default_max_cost() -> f64 {
    1.0
}

fn default_max_iterations() -> u32 {
    200
}

fn default_max_concurrency() -> usize {
    4
}

fn default_retry_limit() -> u32 {
    3
}

fn default_tool_retry_limit() -> u32 {
    3
}

fn default_provider_retry_limit() -> u32 {
    3
}

fn default_provider_backoff_ms() -> u64 {
    500
}

fn default_max_session_iterations() -> u32 {
    40
}

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_command_timeout_secs() -> u64 {
    120
}

fn default_handoff_max_chars() -> usize {
    1200
}

fn default_state_dir() -> String {
    ".convoy".to_string()
}

fn default_todo_file() -> String {
    "TODO.md".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_cost: default_max_cost(),
            max_iterations: default_max_iterations(),
            max_concurrency: default_max_concurrency(),
            retry_limit: default_retry_limit(),
            tool_retry_limit: default_tool_retry_limit(),
            provider_retry_limit: default_provider_retry_limit(),
            provider_backoff_ms: default_provider_backoff_ms(),
            max_session_cost: None,
            max_session_iterations: default_max_session_iterations(),
            max_output_tokens: default_max_output_tokens(),
            pricing: PricingConfig::default(),
            command_timeout_secs: default_command_timeout_secs(),
            handoff_max_chars: default_handoff_max_chars(),
            scopes: BTreeMap::new(),
            allowed_tools: None,
            allow_commands: false,
            review_categories: Vec::new(),
            verifier: VerifierConfig::default(),
            provider: None,
            state_dir: default_state_dir(),
            todo_file: default_todo_file(),
        }
    }
}

impl OrchestratorConfig {
    /// Reads YAML (`.yaml`/`.yml`) or JSON (anything else).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            Ok(serde_yaml::from_str(&content)?)
        } else {
            serde_json::from_str(&content).map_err(|e| {
                OrchestratorError::Config(format!("failed to parse {}: {}", path.display(), e))
            })
        }
    }

    /// Applies `CONVOY_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
            raw.trim().parse::<T>().map_err(|_| {
                OrchestratorError::Config(format!("{} has an invalid value `{}`", key, raw))
            })
        }

        if let Some(raw) = lookup("CONVOY_MAX_COST") {
            self.max_cost = parse("CONVOY_MAX_COST", &raw)?;
        }
        if let Some(raw) = lookup("CONVOY_MAX_ITERATIONS") {
            self.max_iterations = parse("CONVOY_MAX_ITERATIONS", &raw)?;
        }
        if let Some(raw) = lookup("CONVOY_MAX_CONCURRENCY") {
            self.max_concurrency = parse("CONVOY_MAX_CONCURRENCY", &raw)?;
        }
        if let Some(raw) = lookup("CONVOY_RETRY_LIMIT") {
            self.retry_limit = parse("CONVOY_RETRY_LIMIT", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(OrchestratorError::Validation(msg.to_string()));
        if !self.max_cost.is_finite() || self.max_cost <= 0.0 {
            return invalid("max_cost must be a positive number");
        }
        if self.max_iterations == 0 {
            return invalid("max_iterations must be at least 1");
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be at least 1");
        }
        if self.retry_limit == 0 {
            return invalid("retry_limit must be at least 1");
        }
        if self.max_session_iterations == 0 {
            return invalid("max_session_iterations must be at least 1");
        }
        if let Some(cap) = self.max_session_cost {
            if !cap.is_finite() || cap <= 0.0 {
                return invalid("max_session_cost must be a positive number");
            }
        }
        if self.max_output_tokens == 0 {
            return invalid("max_output_tokens must be at least 1");
        }
        if self.pricing.input_per_mtok < 0.0 || self.pricing.output_per_mtok < 0.0 {
            return invalid("pricing must not be negative");
        }
        if self.state_dir.trim().is_empty() || self.todo_file.trim().is_empty() {
            return invalid("state_dir and todo_file must not be empty");
        }
        for (category, paths) in &self.scopes {
            if paths.is_empty() {
                return Err(OrchestratorError::Validation(format!(
                    "scope `{}` lists no paths",
                    category
                )));
            }
        }
        if matches!(self.verifier.kind, VerifierKind::Command | VerifierKind::Chain)
            && self
                .verifier
                .check_command
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return invalid("verifier.check_command is required for command verification");
        }
        Ok(())
    }
}
