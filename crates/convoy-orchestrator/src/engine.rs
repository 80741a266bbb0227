// Orchestrator Engine
// Plans partitions, drives agent sessions per mode and keeps the run snapshot current

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use convoy_observability::{emit_event, ObservabilityEvent, ProcessKind};
use convoy_providers::CompletionService;
use convoy_tools::ToolRegistry;
use convoy_types::{prefixed_id, Todo, TodoStatus};

use crate::audit::{verifier_from_config, AuditGate, Verifier};
use crate::budget::BudgetLedger;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::prompts::build_handoff_summary;
use crate::session::{
    new_session_record, resolve_allowed_tools, AgentSession, SessionOutcome, SessionPlan,
    SessionServices, SessionUpdate,
};
use crate::store::RunStore;
use crate::todo_store::{partition_by_category, TodoStore};
use crate::types::{
    AgentRole, AgentState, OrchestratorEvent, Partition, PartitionStatus, Run, RunMode, RunStatus,
};

/// Partition id used by `single` mode.
pub const SINGLE_PARTITION: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortTarget {
    Session(String),
    All,
}

impl std::fmt::Display for AbortTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortTarget::Session(id) => write!(f, "session:{}", id),
            AbortTarget::All => f.write_str("all"),
        }
    }
}

// ============================================================================
// Planning
// ============================================================================

/// Result of planning without starting a run (`convoy partitions`).
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    pub todos: Vec<Todo>,
    pub partitions: Vec<Partition>,
    pub warnings: Vec<String>,
}

/// Loads the todo list and partitions its unfinished items for `mode`.
/// Fails with a validation error when scopes are missing or, in parallel
/// mode, overlap. Nothing is written.
pub async fn plan_partitions(
    workspace: &Path,
    config: &OrchestratorConfig,
    mode: RunMode,
) -> Result<PartitionPlan> {
    let todo_store = TodoStore::new(workspace.join(&config.todo_file));
    let loaded = todo_store.load().await?;
    let actionable = loaded
        .todos
        .iter()
        .filter(|t| !t.status.is_terminal())
        .cloned()
        .collect::<Vec<_>>();

    let mut partitions = match mode {
        RunMode::Single if actionable.is_empty() => Vec::new(),
        RunMode::Single => vec![Partition::new(
            SINGLE_PARTITION,
            SINGLE_PARTITION,
            actionable.iter().map(|t| t.id.clone()).collect(),
        )],
        RunMode::SequentialMulti | RunMode::ParallelMulti => partition_by_category(&actionable),
    };
    for partition in &mut partitions {
        partition.allowed_paths = resolve_scope(workspace, config, mode, &partition.category)?;
    }
    if mode == RunMode::ParallelMulti {
        ensure_disjoint(&partitions)?;
    }

    Ok(PartitionPlan {
        todos: loaded.todos,
        partitions,
        warnings: loaded.warnings,
    })
}

fn resolve_scope(
    workspace: &Path,
    config: &OrchestratorConfig,
    mode: RunMode,
    category: &str,
) -> Result<Vec<PathBuf>> {
    if mode == RunMode::Single {
        return Ok(vec![workspace.to_path_buf()]);
    }
    if let Some(paths) = config.scopes.get(category) {
        let mut resolved = Vec::with_capacity(paths.len());
        for path in paths {
            let full = if path.is_absolute() {
                path.clone()
            } else {
                workspace.join(path)
            };
            let canonical = std::fs::canonicalize(&full).map_err(|e| {
                OrchestratorError::Validation(format!(
                    "scope `{}` path {} is unusable: {}",
                    category,
                    full.display(),
                    e
                ))
            })?;
            if !canonical.starts_with(workspace) {
                return Err(OrchestratorError::Validation(format!(
                    "scope `{}` path {} is outside the workspace",
                    category,
                    full.display()
                )));
            }
            resolved.push(canonical);
        }
        return Ok(resolved);
    }
    let by_name = workspace.join(category);
    if by_name.is_dir() {
        return Ok(vec![by_name]);
    }
    Ok(vec![workspace.to_path_buf()])
}

fn ensure_disjoint(partitions: &[Partition]) -> Result<()> {
    for (i, a) in partitions.iter().enumerate() {
        for b in &partitions[i + 1..] {
            for pa in &a.allowed_paths {
                for pb in &b.allowed_paths {
                    if pa.starts_with(pb) || pb.starts_with(pa) {
                        return Err(OrchestratorError::Validation(format!(
                            "partitions `{}` and `{}` share files ({} / {}); parallel mode needs disjoint scopes",
                            a.id,
                            b.id,
                            pa.display(),
                            pb.display()
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

fn canonical_workspace(path: &Path) -> Result<PathBuf> {
    let canonical = std::fs::canonicalize(path).map_err(|e| {
        OrchestratorError::Validation(format!("workspace {} is unusable: {}", path.display(), e))
    })?;
    if !canonical.is_dir() {
        return Err(OrchestratorError::Validation(format!(
            "workspace {} is not a directory",
            path.display()
        )));
    }
    Ok(canonical)
}

/// Summary of the last completed partition, for sequential runs that resume
/// midway.
fn initial_handoff(run: &Run, max_chars: usize) -> Option<String> {
    if run.mode != RunMode::SequentialMulti {
        return None;
    }
    run.partitions
        .iter()
        .filter(|p| p.status == PartitionStatus::Completed)
        .last()
        .and_then(|p| {
            let record = p.agent_id.as_deref().and_then(|id| run.agent(id))?;
            Some(build_handoff_summary(record, &run.todos_in(p), max_chars))
        })
}

// ============================================================================
// Builder
// ============================================================================

pub struct OrchestratorBuilder {
    workspace: PathBuf,
    config: OrchestratorConfig,
    provider: Arc<dyn CompletionService>,
    verifier: Option<Arc<dyn Verifier>>,
    registry: ToolRegistry,
    events: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
    process: ProcessKind,
}

impl OrchestratorBuilder {
    pub fn new(
        workspace: impl Into<PathBuf>,
        config: OrchestratorConfig,
        provider: Arc<dyn CompletionService>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            config,
            provider,
            verifier: None,
            registry: ToolRegistry::builtin(),
            events: None,
            process: ProcessKind::Run,
        }
    }

    /// Overrides the verifier built from `config.verifier`.
    pub fn verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn events(mut self, events: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn process(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    /// Plans a new run and persists its first snapshot. Validation problems
    /// surface here, before any session exists.
    pub async fn start(self, task_description: &str, mode: RunMode) -> Result<Orchestrator> {
        self.config.validate()?;
        let task = task_description.trim();
        if task.is_empty() {
            return Err(OrchestratorError::Validation(
                "task description must not be empty".to_string(),
            ));
        }
        let workspace = canonical_workspace(&self.workspace)?;
        let plan = plan_partitions(&workspace, &self.config, mode).await?;
        for warning in &plan.warnings {
            tracing::warn!(workspace = %workspace.display(), "todo list: {}", warning);
        }

        let store = RunStore::new(&workspace, &self.config.state_dir)?;
        let todo_path = workspace.join(&self.config.todo_file);
        let todo_store = TodoStore::new(&todo_path);

        // Leftovers from an interrupted run that was never resumed.
        let mut todos = plan.todos;
        for todo in todos.iter_mut().filter(|t| t.status == TodoStatus::InProgress) {
            todo_store.mark_reopened(&todo.id).await?;
            todo.status = TodoStatus::Open;
        }

        let ledger = Arc::new(BudgetLedger::new(
            self.config.max_cost,
            self.config.max_iterations,
        ));
        let run = Run {
            id: prefixed_id("run"),
            task_description: task.to_string(),
            mode,
            workspace: workspace.clone(),
            todo_path,
            partitions: plan.partitions,
            agents: Vec::new(),
            todos,
            status: RunStatus::Running,
            budget: ledger.snapshot(),
            audits: Vec::new(),
            load_warnings: plan.warnings,
            config: self.config.clone(),
            created_at: Utc::now(),
            ended_at: None,
            error_message: None,
        };
        let partitions = run.partitions.len();

        let orchestrator = self.assemble(run, store, todo_store, ledger)?;
        orchestrator.persist().await?;
        orchestrator.emit(OrchestratorEvent::RunStarted {
            run_id: orchestrator.run_id.clone(),
            mode,
            partitions,
            timestamp: Utc::now(),
        });
        emit_event(
            Level::INFO,
            orchestrator.process,
            ObservabilityEvent::new("orchestrator", "run_started")
                .run(&orchestrator.run_id)
                .status(mode.as_str()),
        );
        tracing::info!(run_id = %orchestrator.run_id, mode = %mode, partitions, "run planned");
        Ok(orchestrator)
    }

    /// Reloads an interrupted run. Its persisted configuration wins over the
    /// builder's; only `state_dir` is taken from the builder to find it.
    pub async fn resume(self, run_id: &str) -> Result<Orchestrator> {
        let workspace = canonical_workspace(&self.workspace)?;
        let store = RunStore::new(&workspace, &self.config.state_dir)?;
        let mut run = store.load_run(run_id)?;
        if run.status.is_terminal() {
            return Err(OrchestratorError::Validation(format!(
                "run `{}` already finished ({})",
                run_id,
                run.status.as_str()
            )));
        }
        // The snapshot's config drives the resumed run; it may have been
        // edited on disk since it was written.
        run.config.validate()?;
        if store.is_archived(run_id) {
            store.restore_run(run_id)?;
        }

        let todo_store = TodoStore::new(&run.todo_path);
        let ledger = Arc::new(BudgetLedger::restore(&run.budget));

        let pending = run
            .partitions
            .iter()
            .filter(|p| !p.status.is_terminal())
            .flat_map(|p| p.todo_ids.clone())
            .collect::<Vec<_>>();
        let mut requeued = 0;
        for id in pending {
            let Some(todo) = run.todo_mut(&id) else {
                continue;
            };
            if todo.status != TodoStatus::InProgress {
                continue;
            }
            match todo_store.mark_reopened(&id).await {
                Ok(_) => {}
                Err(OrchestratorError::InvalidTransition(msg)) => {
                    tracing::warn!(todo_id = %id, "todo changed outside the run: {}", msg);
                }
                Err(err) => return Err(err),
            }
            todo.status = TodoStatus::Open;
            requeued += 1;
        }
        for partition in run
            .partitions
            .iter_mut()
            .filter(|p| p.status == PartitionStatus::Running)
        {
            partition.status = PartitionStatus::Pending;
        }

        let orchestrator = self.assemble(run, store, todo_store, ledger)?;
        orchestrator.persist().await?;
        orchestrator.emit(OrchestratorEvent::RunResumed {
            run_id: orchestrator.run_id.clone(),
            requeued_todos: requeued,
            timestamp: Utc::now(),
        });
        emit_event(
            Level::INFO,
            orchestrator.process,
            ObservabilityEvent::new("orchestrator", "run_resumed").run(&orchestrator.run_id),
        );
        tracing::info!(run_id = %orchestrator.run_id, requeued, "run resumed");
        Ok(orchestrator)
    }

    fn assemble(
        self,
        run: Run,
        store: RunStore,
        todo_store: TodoStore,
        ledger: Arc<BudgetLedger>,
    ) -> Result<Orchestrator> {
        let config = Arc::new(run.config.clone());
        let verifier = match self.verifier {
            Some(verifier) => verifier,
            None => verifier_from_config(&config, self.provider.clone())?,
        };
        let audit = Arc::new(AuditGate::new(verifier, config.retry_limit));
        for agent in &run.agents {
            audit.seed(&agent.id, agent.retry_count);
        }
        Ok(Orchestrator {
            run_id: run.id.clone(),
            workspace: run.workspace.clone(),
            run: Arc::new(RwLock::new(run)),
            config,
            provider: self.provider,
            audit,
            registry: self.registry,
            ledger,
            todo_store: Arc::new(todo_store),
            store,
            cancel: CancellationToken::new(),
            session_tokens: Arc::new(StdMutex::new(HashMap::new())),
            events: self.events,
            process: self.process,
        })
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Owns one run. Clones share state, so a clone can `abort` while another
/// is inside `dispatch`.
#[derive(Clone)]
pub struct Orchestrator {
    run_id: String,
    workspace: PathBuf,
    run: Arc<RwLock<Run>>,
    config: Arc<OrchestratorConfig>,
    provider: Arc<dyn CompletionService>,
    audit: Arc<AuditGate>,
    registry: ToolRegistry,
    ledger: Arc<BudgetLedger>,
    todo_store: Arc<TodoStore>,
    store: RunStore,
    /// Run-level token; every session gets a child.
    cancel: CancellationToken,
    session_tokens: Arc<StdMutex<HashMap<String, CancellationToken>>>,
    events: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
    process: ProcessKind,
}

impl Orchestrator {
    pub fn builder(
        workspace: impl Into<PathBuf>,
        config: OrchestratorConfig,
        provider: Arc<dyn CompletionService>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(workspace, config, provider)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub async fn snapshot(&self) -> Run {
        self.run.read().await.clone()
    }

    /// Runs every pending partition to a terminal state and closes the run.
    pub async fn dispatch(&self) -> Result<Run> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        match self.run_sessions(tx, &mut rx).await {
            Ok(()) => self.finish(None).await,
            Err(err) => {
                tracing::error!(run_id = %self.run_id, error = %err, "run halted");
                self.cancel.cancel();
                self.fail_remaining(&err.to_string()).await;
                if let Err(finish_err) = self.finish(Some(err.to_string())).await {
                    tracing::error!(run_id = %self.run_id, error = %finish_err, "failed to close halted run");
                }
                Err(err)
            }
        }
    }

    pub async fn abort(&self, target: AbortTarget) -> Result<()> {
        match &target {
            AbortTarget::All => self.cancel.cancel(),
            AbortTarget::Session(id) => {
                let token = self
                    .session_tokens
                    .lock()
                    .ok()
                    .and_then(|tokens| tokens.get(id).cloned());
                match token {
                    Some(token) => token.cancel(),
                    None => {
                        if self.run.read().await.agent(id).is_none() {
                            return Err(OrchestratorError::NotFound(format!("session `{}`", id)));
                        }
                        tracing::debug!(session_id = %id, "abort ignored; session is not running");
                        return Ok(());
                    }
                }
            }
        }
        self.emit(OrchestratorEvent::AbortRequested {
            run_id: self.run_id.clone(),
            target: target.to_string(),
            timestamp: Utc::now(),
        });
        emit_event(
            Level::WARN,
            self.process,
            ObservabilityEvent::new("orchestrator", "abort_requested")
                .run(&self.run_id)
                .detail(&target.to_string()),
        );
        Ok(())
    }

    /// Settles a finished session: its partition's todos become `done` or
    /// `failed`, the partition closes and the snapshot is persisted. Returns
    /// the handoff summary for the next sequential session.
    pub async fn on_session_terminal(&self, session_id: &str) -> Result<String> {
        let (record, partition) = {
            let run = self.run.read().await;
            let record = run
                .agent(session_id)
                .cloned()
                .ok_or_else(|| OrchestratorError::NotFound(format!("session `{}`", session_id)))?;
            let partition = run.partition(&record.partition_id).cloned().ok_or_else(|| {
                OrchestratorError::Fatal(format!(
                    "session `{}` belongs to unknown partition `{}`",
                    session_id, record.partition_id
                ))
            })?;
            (record, partition)
        };
        if !record.state.is_terminal() {
            return Err(OrchestratorError::InvalidTransition(format!(
                "session `{}` is still {}",
                session_id,
                record.state.as_str()
            )));
        }
        if let Ok(mut tokens) = self.session_tokens.lock() {
            tokens.remove(session_id);
        }

        if !partition.status.is_terminal() {
            let (partition_status, todo_status) = if record.state == AgentState::Completed {
                (PartitionStatus::Completed, TodoStatus::Done)
            } else {
                (PartitionStatus::Failed, TodoStatus::Failed)
            };
            for todo_id in &partition.todo_ids {
                self.settle_todo(todo_id, todo_status, Some(&record.id)).await;
            }
            self.close_partition(&partition.id, partition_status).await?;
        }

        let run = self.run.read().await;
        Ok(build_handoff_summary(
            &record,
            &run.todos_in(&partition),
            self.config.handoff_max_chars,
        ))
    }

    // ========================================================================
    // Dispatch loop
    // ========================================================================

    async fn run_sessions(
        &self,
        updates: mpsc::UnboundedSender<SessionUpdate>,
        rx: &mut mpsc::UnboundedReceiver<SessionUpdate>,
    ) -> Result<()> {
        let (mode, mut queue, mut handoff) = {
            let run = self.run.read().await;
            let queue = run
                .partitions
                .iter()
                .filter(|p| !p.status.is_terminal())
                .map(|p| p.id.clone())
                .collect::<VecDeque<_>>();
            (run.mode, queue, initial_handoff(&run, self.config.handoff_max_chars))
        };
        let limit = match mode {
            RunMode::ParallelMulti => self.config.max_concurrency,
            RunMode::Single | RunMode::SequentialMulti => 1,
        };
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut join_set: JoinSet<SessionOutcome> = JoinSet::new();

        loop {
            if self.cancel.is_cancelled() {
                while let Some(partition_id) = queue.pop_front() {
                    self.fail_unstarted(&partition_id, "run cancelled before this partition started")
                        .await?;
                }
            }

            while !queue.is_empty() {
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                let Some(partition_id) = queue.pop_front() else {
                    break;
                };
                let session = match self
                    .prepare_session(&partition_id, handoff.clone(), updates.clone())
                    .await
                {
                    Ok(session) => session,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        tracing::warn!(partition = %partition_id, error = %err, "session could not start");
                        self.fail_unstarted(&partition_id, &err.to_string()).await?;
                        continue;
                    }
                };
                join_set.spawn(async move {
                    let _permit = permit;
                    session.run().await
                });
            }

            if join_set.is_empty() {
                self.drain_updates(rx).await?;
                if queue.is_empty() {
                    return Ok(());
                }
                continue;
            }

            tokio::select! {
                Some(update) = rx.recv() => self.apply_update(update).await?,
                joined = join_set.join_next() => {
                    let Some(joined) = joined else { continue };
                    let outcome = joined.map_err(|e| {
                        OrchestratorError::Fatal(format!("session task failed: {}", e))
                    })?;
                    self.drain_updates(rx).await?;
                    let completed = outcome.is_completed();
                    let summary = self.handle_outcome(outcome).await?;
                    if mode == RunMode::SequentialMulti && completed {
                        handoff = Some(summary);
                    }
                }
            }
        }
    }

    async fn prepare_session(
        &self,
        partition_id: &str,
        handoff: Option<String>,
        updates: mpsc::UnboundedSender<SessionUpdate>,
    ) -> Result<AgentSession> {
        let (plan, resumed) = {
            let run = self.run.read().await;
            let partition = run.partition(partition_id).cloned().ok_or_else(|| {
                OrchestratorError::Fatal(format!("unknown partition `{}`", partition_id))
            })?;
            let existing = partition
                .agent_id
                .as_deref()
                .and_then(|id| run.agent(id))
                .filter(|agent| !agent.state.is_terminal())
                .cloned();
            let resumed = existing.is_some();
            let record = match existing {
                Some(record) => record,
                None => {
                    let role = match run.mode {
                        RunMode::Single => AgentRole::Single,
                        _ if self.config.review_categories.contains(&partition.category) => {
                            AgentRole::Supervisor
                        }
                        RunMode::SequentialMulti | RunMode::ParallelMulti => AgentRole::Worker,
                    };
                    let commands =
                        self.config.allow_commands && run.mode != RunMode::ParallelMulti;
                    let tools = resolve_allowed_tools(
                        role,
                        self.config.allowed_tools.as_deref(),
                        commands,
                    );
                    new_session_record(role, &partition, tools, handoff)
                }
            };
            let mut todos = run.todos_in(&partition);
            for todo in todos.iter_mut().filter(|t| t.status == TodoStatus::Open) {
                todo.status = TodoStatus::InProgress;
                todo.owning_agent_id = Some(record.id.clone());
            }
            let plan = SessionPlan {
                record,
                category: partition.category.clone(),
                task_description: run.task_description.clone(),
                todos,
                protected_paths: vec![
                    run.todo_path.clone(),
                    self.workspace.join(&self.config.state_dir),
                ],
            };
            (plan, resumed)
        };

        let record = plan.record.clone();
        let token = self.cancel.child_token();
        let services = SessionServices {
            run_id: self.run_id.clone(),
            process: self.process,
            config: self.config.clone(),
            provider: self.provider.clone(),
            audit: self.audit.clone(),
            ledger: self.ledger.clone(),
            updates,
        };
        let session = AgentSession::new(plan, &self.registry, services, token.clone())?;

        {
            let mut run = self.run.write().await;
            run.upsert_agent(record.clone());
            if let Some(partition) = run.partition_mut(partition_id) {
                partition.status = PartitionStatus::Running;
                partition.agent_id = Some(record.id.clone());
            }
        }
        if let Ok(mut tokens) = self.session_tokens.lock() {
            tokens.insert(record.id.clone(), token);
        }
        for todo_id in &record.todo_ids {
            self.set_todo_status(todo_id, TodoStatus::InProgress, Some(&record.id))
                .await?;
        }
        self.persist().await?;

        if !resumed {
            self.emit(OrchestratorEvent::SessionCreated {
                run_id: self.run_id.clone(),
                session_id: record.id.clone(),
                partition_id: partition_id.to_string(),
                timestamp: Utc::now(),
            });
        }
        tracing::info!(
            run_id = %self.run_id,
            session_id = %record.id,
            partition = %partition_id,
            resumed,
            "session ready"
        );
        Ok(session)
    }

    async fn handle_outcome(&self, outcome: SessionOutcome) -> Result<String> {
        let SessionOutcome { record, error } = outcome;
        let session_id = record.id.clone();
        {
            let mut run = self.run.write().await;
            run.upsert_agent(record);
            run.budget = self.ledger.snapshot();
        }
        if self.ledger.is_exhausted() && !self.cancel.is_cancelled() {
            tracing::warn!(run_id = %self.run_id, "run budget exhausted; cancelling remaining sessions");
            self.cancel.cancel();
        }
        let summary = self.on_session_terminal(&session_id).await?;
        match error {
            Some(err) if err.is_fatal() => Err(err),
            _ => Ok(summary),
        }
    }

    async fn apply_update(&self, update: SessionUpdate) -> Result<()> {
        match update {
            SessionUpdate::Snapshot(record) => {
                {
                    let mut run = self.run.write().await;
                    run.upsert_agent(*record);
                    run.budget = self.ledger.snapshot();
                }
                self.persist().await
            }
            SessionUpdate::Audit(audit) => {
                self.run.write().await.audits.push(audit);
                self.persist().await
            }
            SessionUpdate::Event(event) => {
                self.emit(event);
                Ok(())
            }
        }
    }

    async fn drain_updates(&self, rx: &mut mpsc::UnboundedReceiver<SessionUpdate>) -> Result<()> {
        while let Ok(update) = rx.try_recv() {
            self.apply_update(update).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Todos and partitions
    // ========================================================================

    async fn set_todo_status(
        &self,
        todo_id: &str,
        target: TodoStatus,
        owner: Option<&str>,
    ) -> Result<()> {
        let current = {
            let run = self.run.read().await;
            run.todos
                .iter()
                .find(|t| t.id == todo_id)
                .map(|t| t.status)
                .ok_or_else(|| OrchestratorError::NotFound(format!("todo `{}`", todo_id)))?
        };
        if current == target || current.is_terminal() {
            return Ok(());
        }
        if current == TodoStatus::Open && target.is_terminal() {
            self.todo_store.mark_in_progress(todo_id).await?;
        }
        let updated = match target {
            TodoStatus::Open => self.todo_store.mark_reopened(todo_id).await?,
            TodoStatus::InProgress => self.todo_store.mark_in_progress(todo_id).await?,
            TodoStatus::Done => self.todo_store.mark_done(todo_id).await?,
            TodoStatus::Failed => self.todo_store.mark_failed(todo_id).await?,
        };
        {
            let mut run = self.run.write().await;
            if let Some(todo) = run.todo_mut(todo_id) {
                todo.status = updated.status;
                if let Some(owner) = owner {
                    todo.owning_agent_id = Some(owner.to_string());
                }
            }
        }
        self.emit(OrchestratorEvent::TodoStatusChanged {
            run_id: self.run_id.clone(),
            todo_id: todo_id.to_string(),
            status: updated.status,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Best-effort status change used while closing partitions; a failure
    /// here must not hide the session's own outcome.
    async fn settle_todo(&self, todo_id: &str, target: TodoStatus, owner: Option<&str>) {
        if let Err(err) = self.set_todo_status(todo_id, target, owner).await {
            tracing::warn!(todo_id = %todo_id, target = %target, error = %err, "could not settle todo");
        }
    }

    async fn close_partition(&self, partition_id: &str, status: PartitionStatus) -> Result<()> {
        {
            let mut run = self.run.write().await;
            if let Some(partition) = run.partition_mut(partition_id) {
                partition.status = status;
            }
            run.budget = self.ledger.snapshot();
        }
        self.persist().await?;
        self.emit(OrchestratorEvent::PartitionFinished {
            run_id: self.run_id.clone(),
            partition_id: partition_id.to_string(),
            status,
            timestamp: Utc::now(),
        });
        let status_str = match status {
            PartitionStatus::Completed => "completed",
            PartitionStatus::Failed => "failed",
            PartitionStatus::Pending => "pending",
            PartitionStatus::Running => "running",
        };
        emit_event(
            if status == PartitionStatus::Failed { Level::WARN } else { Level::INFO },
            self.process,
            ObservabilityEvent::new("orchestrator", "partition_finished")
                .run(&self.run_id)
                .partition(partition_id)
                .status(status_str),
        );
        Ok(())
    }

    /// Fails a partition whose session never ran (cancelled run or a session
    /// that could not be built).
    async fn fail_unstarted(&self, partition_id: &str, reason: &str) -> Result<()> {
        let todo_ids = {
            let mut run = self.run.write().await;
            let agent_id = run.partition(partition_id).and_then(|p| p.agent_id.clone());
            if let Some(agent_id) = agent_id {
                if let Some(agent) = run.agents.iter_mut().find(|a| a.id == agent_id) {
                    if !agent.state.is_terminal() {
                        agent.state = AgentState::Failed;
                        agent.failure_reason = Some(reason.to_string());
                        agent.issues.push(reason.to_string());
                        agent.updated_at = Utc::now();
                    }
                }
            }
            run.partition(partition_id)
                .map(|p| p.todo_ids.clone())
                .unwrap_or_default()
        };
        for todo_id in &todo_ids {
            self.settle_todo(todo_id, TodoStatus::Failed, None).await;
        }
        self.close_partition(partition_id, PartitionStatus::Failed).await
    }

    /// After a fatal error: close whatever is still open without touching
    /// the error path again.
    async fn fail_remaining(&self, reason: &str) {
        let open = {
            let run = self.run.read().await;
            run.partitions
                .iter()
                .filter(|p| !p.status.is_terminal())
                .map(|p| p.id.clone())
                .collect::<Vec<_>>()
        };
        for partition_id in open {
            if let Err(err) = self.fail_unstarted(&partition_id, reason).await {
                tracing::error!(partition = %partition_id, error = %err, "could not close partition");
            }
        }
    }

    // ========================================================================
    // Persistence and events
    // ========================================================================

    async fn finish(&self, error: Option<String>) -> Result<Run> {
        let run = {
            let mut run = self.run.write().await;
            run.budget = self.ledger.snapshot();
            run.status = run.derive_status();
            if run.status == RunStatus::Running {
                run.status = RunStatus::Failed;
                run.error_message
                    .get_or_insert_with(|| "dispatch ended with unfinished partitions".to_string());
            }
            if let Some(message) = error {
                run.status = RunStatus::Failed;
                run.error_message = Some(message);
            }
            run.ended_at = Some(Utc::now());
            run.clone()
        };
        self.store.save_run(&run)?;
        self.emit(OrchestratorEvent::RunFinished {
            run_id: self.run_id.clone(),
            status: run.status,
            timestamp: Utc::now(),
        });
        emit_event(
            if run.status == RunStatus::Completed { Level::INFO } else { Level::WARN },
            self.process,
            ObservabilityEvent::new("orchestrator", "run_finished")
                .run(&self.run_id)
                .status(run.status.as_str()),
        );
        let counts = run.todo_counts();
        tracing::info!(
            run_id = %self.run_id,
            status = run.status.as_str(),
            done = counts.done,
            failed = counts.failed,
            spent = run.budget.spent,
            "run finished"
        );
        self.store.archive_run(&self.run_id)?;
        Ok(run)
    }

    async fn persist(&self) -> Result<()> {
        let run = self.run.read().await;
        self.store.save_run(&run)
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Err(err) = self.store.append_event(&self.run_id, &event) {
            tracing::warn!(run_id = %self.run_id, error = %err, "failed to append event");
        }
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
