// Agent Session
// One agent's reasoning loop over its partition: completion calls, tool calls, audit

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use convoy_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use convoy_providers::{CompletionRequest, CompletionResponse, CompletionService, ProviderError};
use convoy_tools::{
    RestrictedFileSystem, SessionTodos, ToolContext, ToolRegistry, ToolSet, RUN_COMMAND,
};
use convoy_types::{prefixed_id, ChatMessage, MessageRole, Todo, ToolCall};

use crate::audit::{AuditGate, AuditRequest};
use crate::budget::{BudgetGuard, BudgetLedger};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::prompts::{
    build_continue_nudge, build_kickoff_message, build_retry_message, build_system_prompt,
    contains_completion_marker, SystemPromptInput,
};
use crate::types::{
    AgentRole, AgentSessionRecord, AgentState, AuditRecord, AuditScope, OrchestratorEvent,
    Partition, Verdict,
};

/// What a running session reports back. Sessions never touch the run
/// directly; the orchestrator applies these in order.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    Snapshot(Box<AgentSessionRecord>),
    Audit(AuditRecord),
    Event(OrchestratorEvent),
}

/// Collaborators shared by every session of a run.
#[derive(Clone)]
pub struct SessionServices {
    pub run_id: String,
    pub process: ProcessKind,
    pub config: Arc<OrchestratorConfig>,
    pub provider: Arc<dyn CompletionService>,
    pub audit: Arc<AuditGate>,
    pub ledger: Arc<BudgetLedger>,
    pub updates: mpsc::UnboundedSender<SessionUpdate>,
}

/// Inputs for building a live session from a (new or restored) record.
pub struct SessionPlan {
    pub record: AgentSessionRecord,
    pub category: String,
    pub task_description: String,
    pub todos: Vec<Todo>,
    pub protected_paths: Vec<PathBuf>,
}

/// Role preset, plus `run_command` when commands are granted, narrowed by
/// the configured allow-list. The allow-list can only remove tools.
pub fn resolve_allowed_tools(
    role: AgentRole,
    configured: Option<&[String]>,
    allow_commands: bool,
) -> Vec<String> {
    let mut tools = role.default_tools();
    if allow_commands && role != AgentRole::Supervisor {
        tools.push(RUN_COMMAND.to_string());
    }
    match configured {
        Some(allowed) => tools
            .into_iter()
            .filter(|tool| allowed.contains(tool))
            .collect(),
        None => tools,
    }
}

pub fn new_session_record(
    role: AgentRole,
    partition: &Partition,
    allowed_tools: Vec<String>,
    handoff: Option<String>,
) -> AgentSessionRecord {
    let now = Utc::now();
    AgentSessionRecord {
        id: prefixed_id("agent"),
        role,
        partition_id: partition.id.clone(),
        todo_ids: partition.todo_ids.clone(),
        allowed_paths: partition.allowed_paths.clone(),
        allowed_tools,
        cost_spent: 0.0,
        iteration_count: 0,
        retry_count: 0,
        tool_failures: 0,
        conversation_history: Vec::new(),
        state: AgentState::Created,
        issues: Vec::new(),
        touched_paths: Vec::new(),
        handoff,
        last_claim: None,
        failure_reason: None,
        created_at: now,
        updated_at: now,
    }
}

/// Final state handed back to the orchestrator.
#[derive(Debug)]
pub struct SessionOutcome {
    pub record: AgentSessionRecord,
    pub error: Option<OrchestratorError>,
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        self.record.state == AgentState::Completed
    }
}

pub struct AgentSession {
    record: AgentSessionRecord,
    fs: Arc<RestrictedFileSystem>,
    todos: Arc<SessionTodos>,
    guard: BudgetGuard,
    tools: ToolSet,
    cancel: CancellationToken,
    services: SessionServices,
    system_prompt: String,
    prior_touched: Vec<PathBuf>,
}

impl AgentSession {
    pub fn new(
        plan: SessionPlan,
        registry: &ToolRegistry,
        services: SessionServices,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let SessionPlan {
            mut record,
            category,
            task_description,
            todos,
            protected_paths,
        } = plan;

        let fs = RestrictedFileSystem::new(&record.allowed_paths)?.with_protected(protected_paths);
        let tools = registry.resolve(&record.allowed_tools)?;
        let config = &services.config;
        let guard = BudgetGuard::new(
            services.ledger.clone(),
            config.max_session_cost,
            Some(config.max_session_iterations),
        )
        .with_usage(record.cost_spent, record.iteration_count);

        let tool_names = tools.names();
        let system_prompt = build_system_prompt(&SystemPromptInput {
            role: record.role,
            task_description: &task_description,
            partition_category: &category,
            todos: &todos,
            allowed_paths: fs.roots(),
            tool_names: &tool_names,
            handoff: record.handoff.as_deref(),
        });

        repair_history(&mut record.conversation_history);
        let prior_touched = record.touched_paths.clone();

        Ok(Self {
            record,
            fs: Arc::new(fs),
            todos: Arc::new(SessionTodos::new(todos)),
            guard,
            tools,
            cancel,
            services,
            system_prompt,
            prior_touched,
        })
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &AgentSessionRecord {
        &self.record
    }

    /// Drives the loop to a terminal state. Never returns an error: failures
    /// end up in the outcome and in the record.
    pub async fn run(mut self) -> SessionOutcome {
        let error = match self.drive().await {
            Ok(()) => None,
            Err(err) => {
                self.fail(&err);
                Some(err)
            }
        };
        self.fs.close();
        self.snapshot();
        SessionOutcome {
            record: self.record,
            error,
        }
    }

    async fn drive(&mut self) -> Result<()> {
        if self.record.state == AgentState::Created {
            self.transition(AgentState::Running)?;
        }
        if self.record.conversation_history.is_empty() {
            let kickoff = build_kickoff_message(&self.todos.list());
            self.record.conversation_history.push(ChatMessage::user(kickoff));
            self.snapshot();
        }

        loop {
            match self.record.state {
                AgentState::AwaitingAudit => {
                    if self.run_audit().await? {
                        return Ok(());
                    }
                }
                AgentState::Running => self.step().await?,
                state => {
                    return Err(OrchestratorError::InvalidTransition(format!(
                        "session {} cannot run from state {}",
                        self.record.id,
                        state.as_str()
                    )))
                }
            }
        }
    }

    // ========================================================================
    // Reasoning loop
    // ========================================================================

    async fn step(&mut self) -> Result<()> {
        self.check_cancelled()?;
        self.guard.iteration_tick()?;
        self.record.iteration_count = self.guard.session_iterations();

        let config = self.services.config.clone();
        let request = CompletionRequest {
            agent_id: self.record.id.clone(),
            scope: self.record.partition_id.clone(),
            system_prompt: self.system_prompt.clone(),
            messages: self.record.conversation_history.clone(),
            tools: self.tools.schemas(),
            max_output_tokens: config.max_output_tokens,
        };
        let estimate = config
            .pricing
            .estimate(request.estimated_prompt_tokens(), config.max_output_tokens);
        let reservation = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(OrchestratorError::Cancelled(
                    "cancelled while waiting for budget".to_string(),
                ));
            }
            reserved = self.guard.reserve(estimate) => reserved?,
        };

        let response = match self.complete_with_retry(request).await {
            Ok(response) => response,
            Err(err) => {
                self.guard.release(reservation);
                return Err(err);
            }
        };

        let actual = response
            .cost
            .or_else(|| response.usage.map(|u| config.pricing.cost_for(&u)))
            .unwrap_or(estimate);
        let committed = self.guard.commit(reservation, actual);
        self.record.cost_spent = self.guard.session_spent();
        committed?;

        let CompletionResponse {
            text, tool_calls, ..
        } = response;
        self.record
            .conversation_history
            .push(ChatMessage::assistant(text.clone(), tool_calls.clone()));

        if tool_calls.is_empty() {
            if contains_completion_marker(&text) {
                tracing::info!(
                    agent_id = %self.record.id,
                    claim = %redact_text(&text),
                    "completion claimed"
                );
                self.record.last_claim = Some(text);
                self.transition(AgentState::AwaitingAudit)?;
            } else {
                self.record
                    .conversation_history
                    .push(ChatMessage::user(build_continue_nudge()));
                self.snapshot();
            }
            return Ok(());
        }

        // One call at a time, in the order the model issued them.
        for call in &tool_calls {
            self.check_cancelled()?;
            self.run_tool(call).await?;
        }
        self.snapshot();
        Ok(())
    }

    async fn complete_with_retry(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let limit = self.services.config.provider_retry_limit;
        let backoff_ms = self.services.config.provider_backoff_ms;
        let mut attempt = 0u32;
        loop {
            let result = self
                .services
                .provider
                .complete(request.clone(), self.cancel.child_token())
                .await;
            match result {
                Ok(response) => return Ok(response),
                Err(ProviderError::Cancelled) => {
                    return Err(OrchestratorError::Cancelled(
                        "completion call cancelled".to_string(),
                    ))
                }
                Err(err) if err.is_retryable() && attempt < limit => {
                    attempt += 1;
                    let delay = Duration::from_millis(
                        backoff_ms.saturating_mul(1u64 << (attempt - 1).min(6)),
                    );
                    tracing::warn!(
                        agent_id = %self.record.id,
                        attempt,
                        limit,
                        code = err.code(),
                        error = %err,
                        "transient provider error; backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Err(OrchestratorError::Cancelled(
                                "cancelled during provider backoff".to_string(),
                            ));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn run_tool(&mut self, call: &ToolCall) -> Result<()> {
        let ctx = ToolContext {
            agent_id: self.record.id.clone(),
            fs: self.fs.clone(),
            todos: self.todos.clone(),
            cancel: self.cancel.clone(),
            command_timeout: Duration::from_secs(self.services.config.command_timeout_secs),
        };
        let result = self.tools.execute(&ctx, call).await;
        self.send(SessionUpdate::Event(OrchestratorEvent::ToolCalled {
            run_id: self.services.run_id.clone(),
            session_id: self.record.id.clone(),
            tool: call.name.clone(),
            ok: result.is_ok(),
            timestamp: Utc::now(),
        }));

        let err = match result {
            Ok(output) => {
                self.record
                    .conversation_history
                    .push(ChatMessage::tool_result(&call.id, output.output));
                return Ok(());
            }
            Err(err) => err,
        };

        self.record
            .conversation_history
            .push(ChatMessage::tool_result(&call.id, format!("error: {}", err)));

        if !err.is_retryable() {
            tracing::warn!(agent_id = %self.record.id, tool = %call.name, error = %err, "tool call failed");
            return Err(err.into());
        }

        self.record.tool_failures += 1;
        let limit = self.services.config.tool_retry_limit;
        if self.record.tool_failures > limit {
            return Err(OrchestratorError::ToolExecution(format!(
                "{} tool failures exceeded the limit of {}; last: {}",
                self.record.tool_failures, limit, err
            )));
        }
        tracing::debug!(
            agent_id = %self.record.id,
            tool = %call.name,
            failures = self.record.tool_failures,
            "retryable tool error fed back to the agent"
        );
        Ok(())
    }

    // ========================================================================
    // Audit
    // ========================================================================

    /// Returns true once the claim passed.
    async fn run_audit(&mut self) -> Result<bool> {
        self.check_cancelled()?;
        let claim = self.record.last_claim.clone().unwrap_or_default();
        let scope = AuditScope {
            partition_id: self.record.partition_id.clone(),
            todo_ids: self.record.todo_ids.clone(),
        };
        let touched = self.touched();
        let todos = self.todos.list();

        let audit = {
            let request = AuditRequest {
                agent_id: &self.record.id,
                scope: &scope,
                todos: &todos,
                touched_paths: &touched,
                claim: &claim,
                workdir: self.fs.primary_root(),
                budget: Some(&self.guard),
            };
            self.services
                .audit
                .evaluate(&request, self.cancel.child_token())
                .await?
        };
        self.check_cancelled()?;

        self.record.cost_spent = self.guard.session_spent();
        self.record.retry_count = audit.retry_count;
        self.send(SessionUpdate::Event(OrchestratorEvent::AuditCompleted {
            run_id: self.services.run_id.clone(),
            session_id: self.record.id.clone(),
            verdict: audit.verdict,
            issues: audit.issues.len(),
            retry_count: audit.retry_count,
            timestamp: Utc::now(),
        }));
        self.send(SessionUpdate::Audit(audit.clone()));
        let issues = redact_text(&audit.issues.join("\n"));
        emit_event(
            Level::INFO,
            self.services.process,
            ObservabilityEvent::new("audit", "completed")
                .run(&self.services.run_id)
                .session(&self.record.id)
                .partition(&self.record.partition_id)
                .status(audit.verdict.as_str())
                .detail(&issues),
        );

        match audit.verdict {
            Verdict::Pass => {
                self.transition(AgentState::Completed)?;
                Ok(true)
            }
            Verdict::Fail => {
                self.record.issues.extend(audit.issues.iter().cloned());
                let message = build_retry_message(
                    &audit.issues,
                    audit.retry_count,
                    self.services.audit.retry_limit(),
                );
                self.record.conversation_history.push(ChatMessage::user(message));
                self.record.last_claim = None;
                self.transition(AgentState::Running)?;
                Ok(false)
            }
            Verdict::Escalate => {
                self.record.issues.extend(audit.issues.iter().cloned());
                Err(OrchestratorError::AuditFailure(format!(
                    "escalated after {} retries: {}",
                    audit.retry_count,
                    audit.issues.join("; ")
                )))
            }
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    fn transition(&mut self, next: AgentState) -> Result<()> {
        let from = self.record.state;
        if !from.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition(format!(
                "session {} cannot move from {} to {}",
                self.record.id,
                from.as_str(),
                next.as_str()
            )));
        }
        self.record.state = next;
        emit_event(
            if next == AgentState::Failed { Level::WARN } else { Level::INFO },
            self.services.process,
            ObservabilityEvent::new("session", "state_changed")
                .run(&self.services.run_id)
                .session(&self.record.id)
                .partition(&self.record.partition_id)
                .status(next.as_str()),
        );
        self.send(SessionUpdate::Event(OrchestratorEvent::SessionStateChanged {
            run_id: self.services.run_id.clone(),
            session_id: self.record.id.clone(),
            from,
            to: next,
            timestamp: Utc::now(),
        }));
        self.snapshot();
        Ok(())
    }

    fn fail(&mut self, err: &OrchestratorError) {
        if self.record.state.is_terminal() {
            return;
        }
        if self.record.state == AgentState::Created {
            let _ = self.transition(AgentState::Running);
        }
        self.record.failure_reason = Some(err.to_string());
        if !matches!(err, OrchestratorError::AuditFailure(_)) {
            self.record.issues.push(err.to_string());
        }
        if let OrchestratorError::BudgetExceeded(exceeded) = err {
            self.send(SessionUpdate::Event(OrchestratorEvent::BudgetExceeded {
                run_id: self.services.run_id.clone(),
                session_id: self.record.id.clone(),
                scope: exceeded.scope,
                reason: exceeded.reason.clone(),
                timestamp: Utc::now(),
            }));
        }
        tracing::warn!(
            agent_id = %self.record.id,
            partition = %self.record.partition_id,
            code = err.code(),
            error = %err,
            "session failed"
        );
        emit_event(
            Level::WARN,
            self.services.process,
            ObservabilityEvent::new("session", "failed")
                .run(&self.services.run_id)
                .session(&self.record.id)
                .partition(&self.record.partition_id)
                .error_code(err.code()),
        );
        if self.transition(AgentState::Failed).is_err() {
            self.record.state = AgentState::Failed;
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled(format!(
                "session {} was aborted",
                self.record.id
            )));
        }
        Ok(())
    }

    fn touched(&self) -> Vec<PathBuf> {
        let mut touched = self.prior_touched.clone();
        for path in self.fs.touched_paths() {
            if !touched.contains(&path) {
                touched.push(path);
            }
        }
        touched
    }

    fn snapshot(&mut self) {
        self.record.touched_paths = self.touched();
        self.record.iteration_count = self.guard.session_iterations();
        self.record.updated_at = Utc::now();
        self.send(SessionUpdate::Snapshot(Box::new(self.record.clone())));
    }

    fn send(&self, update: SessionUpdate) {
        if self.services.updates.send(update).is_err() {
            tracing::debug!(agent_id = %self.record.id, "update receiver dropped");
        }
    }
}

/// Answers tool calls that were interrupted before a result was recorded,
/// so a restored conversation is well formed.
fn repair_history(history: &mut Vec<ChatMessage>) {
    let Some(last_assistant) = history
        .iter()
        .rposition(|m| m.role == MessageRole::Assistant)
    else {
        return;
    };
    let answered = history[last_assistant + 1..]
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .filter_map(|m| m.tool_call_id.clone())
        .collect::<Vec<_>>();
    let missing = history[last_assistant]
        .tool_calls
        .iter()
        .filter(|call| !answered.contains(&call.id))
        .map(|call| call.id.clone())
        .collect::<Vec<_>>();
    for id in missing {
        history.push(ChatMessage::tool_result(
            id,
            "error: interrupted before this call ran",
        ));
    }
}
