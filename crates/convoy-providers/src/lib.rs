// Convoy Providers
// Completion service contract, request/response types and provider errors

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use convoy_types::{ChatMessage, TokenUsage, ToolCall, ToolSchema};

mod process;
pub mod scripted;

pub use process::{ProcessProvider, ProcessProviderConfig};
pub use scripted::{ScriptedProvider, ScriptedReply};

/// Failure of a single completion call. Only `Transient` is retried by the
/// session loop; a timeout is reported as-is.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ProviderError {
    /// Rate limits, overloaded backends, bridges exiting with EX_TEMPFAIL.
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("provider timed out after {0:?}")]
    Timeout(Duration),

    /// Bad configuration or an unusable response.
    #[error("provider error: {0}")]
    Fatal(String),

    #[error("provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// Stable identifier for logs.
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::Transient(_) => "provider_transient",
            ProviderError::Timeout(_) => "provider_timeout",
            ProviderError::Fatal(_) => "provider_fatal",
            ProviderError::Cancelled => "provider_cancelled",
        }
    }
}

/// One turn of a reasoning loop. `scope` identifies the partition the caller
/// works on so bridges and scripted providers can route by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub agent_id: String,
    pub scope: String,
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
    pub max_output_tokens: u32,
}

impl CompletionRequest {
    /// Rough prompt size used for cost reservation before the call.
    pub fn estimated_prompt_tokens(&self) -> u64 {
        let chars: usize = self.system_prompt.len()
            + self
                .messages
                .iter()
                .map(|m| m.content.len() + m.tool_calls.iter().map(|c| c.args.to_string().len()).sum::<usize>())
                .sum::<usize>()
            + self
                .tools
                .iter()
                .map(|t| t.description.len() + t.input_schema.to_string().len())
                .sum::<usize>();
        (chars as u64).div_ceil(4)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CompletionResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub cost: Option<f64>,
}

impl CompletionResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            tool_calls: vec![ToolCall {
                id: id.into(),
                name: name.into(),
                args,
            }],
            ..Default::default()
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionResponse, ProviderError>;
}
