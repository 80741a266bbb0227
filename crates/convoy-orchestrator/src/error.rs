// Convoy Orchestrator Error Types
use thiserror::Error;

use convoy_providers::ProviderError;
use convoy_tools::ToolError;

use crate::budget::BudgetExceeded;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),

    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Audit failure: {0}")]
    AuditFailure(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Fatal orchestrator error: {0}")]
    Fatal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Stable identifier used in events and snapshots.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "validation",
            OrchestratorError::Permission(_) => "permission",
            OrchestratorError::BudgetExceeded(_) => "budget_exceeded",
            OrchestratorError::ToolExecution(_) => "tool_execution",
            OrchestratorError::Provider(_) => "provider",
            OrchestratorError::AuditFailure(_) => "audit_failure",
            OrchestratorError::Cancelled(_) => "cancelled",
            OrchestratorError::Fatal(_) => "fatal",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::InvalidTransition(_) => "invalid_transition",
            OrchestratorError::Config(_) => "config",
            OrchestratorError::Io(_) => "io",
            OrchestratorError::Serialization(_) => "serialization",
        }
    }

    /// Only these stop the whole run; everything else is contained to a session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrchestratorError::Fatal(_))
    }
}

impl From<ToolError> for OrchestratorError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Permission(msg) => OrchestratorError::Permission(msg),
            ToolError::Config(msg) => OrchestratorError::Validation(msg),
            ToolError::Cancelled => OrchestratorError::Cancelled("tool call cancelled".to_string()),
            other => OrchestratorError::ToolExecution(other.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(err: serde_yaml::Error) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
