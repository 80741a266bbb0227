//! Deterministic provider for tests and dry runs.
//!
//! Replies are queued per scope (partition id); calls for a scope without a
//! queue of its own fall back to the shared default queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{CompletionRequest, CompletionResponse, CompletionService, ProviderError};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Respond(CompletionResponse),
    Fail(ProviderError),
    /// Wait, then resolve the inner reply. Cancellation interrupts the wait.
    Delay(Duration, Box<ScriptedReply>),
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Respond(CompletionResponse::text(text))
    }

    pub fn tool(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self::Respond(CompletionResponse::tool_call(id, name, args))
    }

    pub fn costing(self, cost: f64) -> Self {
        match self {
            Self::Respond(response) => Self::Respond(response.with_cost(cost)),
            other => other,
        }
    }

    pub fn delayed(delay: Duration, inner: ScriptedReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

#[derive(Default)]
pub struct ScriptedProvider {
    scopes: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    fallback: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    call_count: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(self, scope: impl Into<String>, replies: Vec<ScriptedReply>) -> Self {
        self.push_all(scope, replies);
        self
    }

    pub fn with_default(self, replies: Vec<ScriptedReply>) -> Self {
        if let Ok(mut fallback) = self.fallback.lock() {
            fallback.extend(replies);
        }
        self
    }

    pub fn push_all(&self, scope: impl Into<String>, replies: Vec<ScriptedReply>) {
        if let Ok(mut scopes) = self.scopes.lock() {
            scopes.entry(scope.into()).or_default().extend(replies);
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self, scope: &str) -> usize {
        self.scopes
            .lock()
            .ok()
            .and_then(|scopes| scopes.get(scope).map(VecDeque::len))
            .unwrap_or(0)
    }

    fn next_reply(&self, scope: &str) -> Option<ScriptedReply> {
        let scoped = self
            .scopes
            .lock()
            .ok()
            .and_then(|mut scopes| scopes.get_mut(scope).and_then(VecDeque::pop_front));
        scoped.or_else(|| self.fallback.lock().ok().and_then(|mut q| q.pop_front()))
    }
}

#[async_trait]
impl CompletionService for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionResponse, ProviderError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let scope = request.scope.clone();
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let Some(mut reply) = self.next_reply(&scope) else {
            return Err(ProviderError::Fatal(format!(
                "no scripted reply left for scope `{}`",
                scope
            )));
        };

        loop {
            match reply {
                ScriptedReply::Respond(response) => return Ok(response),
                ScriptedReply::Fail(err) => return Err(err),
                ScriptedReply::Delay(delay, inner) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    reply = *inner;
                }
            }
        }
    }
}
