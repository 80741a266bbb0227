// Orchestrator Types
// Run, partition, agent session and audit records shared by the engine and the store

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use convoy_tools::{LIST_FILES, LIST_TODOS, READ_FILE, UPDATE_TODO_STATUS, WRITE_FILE};
use convoy_types::{ChatMessage, Todo, TodoStatus};

use crate::budget::BudgetScope;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;

// ============================================================================
// Run Mode & Status
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Single,
    SequentialMulti,
    ParallelMulti,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Single => "single",
            RunMode::SequentialMulti => "sequential-multi",
            RunMode::ParallelMulti => "parallel-multi",
        }
    }
}

impl FromStr for RunMode {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "single" => Ok(RunMode::Single),
            "sequential-multi" | "sequential" => Ok(RunMode::SequentialMulti),
            "parallel-multi" | "parallel" => Ok(RunMode::ParallelMulti),
            other => Err(OrchestratorError::Validation(format!(
                "unknown mode `{}` (expected single, sequential-multi or parallel-multi)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    PartiallyFailed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::PartiallyFailed => "partially_failed",
            RunStatus::Failed => "failed",
        }
    }
}

// ============================================================================
// Partitions
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl PartitionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PartitionStatus::Completed | PartitionStatus::Failed)
    }
}

/// A static, disjoint slice of the todo list owned by exactly one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Partition {
    pub id: String,
    pub category: String,
    pub todo_ids: Vec<String>,
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    pub status: PartitionStatus,
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl Partition {
    pub fn new(id: impl Into<String>, category: impl Into<String>, todo_ids: Vec<String>) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            todo_ids,
            allowed_paths: Vec::new(),
            status: PartitionStatus::Pending,
            agent_id: None,
        }
    }
}

// ============================================================================
// Agent Sessions
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Single,
    Worker,
    Supervisor,
}

impl AgentRole {
    /// Tools a role may use before any configured narrowing. `run_command`
    /// is never part of a preset; it has to be granted explicitly.
    pub fn default_tools(self) -> Vec<String> {
        let preset: &[&str] = match self {
            AgentRole::Single | AgentRole::Worker => {
                &[READ_FILE, WRITE_FILE, LIST_FILES, UPDATE_TODO_STATUS, LIST_TODOS]
            }
            AgentRole::Supervisor => &[READ_FILE, LIST_FILES, LIST_TODOS],
        };
        preset.iter().map(|s| s.to_string()).collect()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Single => "single",
            AgentRole::Worker => "worker",
            AgentRole::Supervisor => "supervisor",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Created,
    Running,
    AwaitingAudit,
    Completed,
    Failed,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Completed | AgentState::Failed)
    }

    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, AwaitingAudit)
                | (Running, Failed)
                | (AwaitingAudit, Completed)
                | (AwaitingAudit, Running)
                | (AwaitingAudit, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Created => "created",
            AgentState::Running => "running",
            AgentState::AwaitingAudit => "awaiting_audit",
            AgentState::Completed => "completed",
            AgentState::Failed => "failed",
        }
    }
}

/// Persisted half of an agent session. Live resources (sandbox, budget
/// guard, tool set) are rebuilt from this on resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSessionRecord {
    pub id: String,
    pub role: AgentRole,
    pub partition_id: String,
    pub todo_ids: Vec<String>,
    pub allowed_paths: Vec<PathBuf>,
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub cost_spent: f64,
    #[serde(default)]
    pub iteration_count: u32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub tool_failures: u32,
    #[serde(default)]
    pub conversation_history: Vec<ChatMessage>,
    pub state: AgentState,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub touched_paths: Vec<PathBuf>,
    #[serde(default)]
    pub handoff: Option<String>,
    #[serde(default)]
    pub last_claim: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Audit
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Escalate,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Escalate => "escalate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditScope {
    pub partition_id: String,
    pub todo_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub agent_id: String,
    pub scope: AuditScope,
    pub verdict: Verdict,
    pub issues: Vec<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Budget
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BudgetSnapshot {
    pub max_cost: f64,
    pub max_iterations: u32,
    pub spent: f64,
    pub iterations_used: u32,
    #[serde(default)]
    pub exhausted: bool,
}

// ============================================================================
// Run
// ============================================================================

/// Root record of one orchestration run; this is what gets snapshotted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: String,
    pub task_description: String,
    pub mode: RunMode,
    pub workspace: PathBuf,
    pub todo_path: PathBuf,
    pub partitions: Vec<Partition>,
    pub agents: Vec<AgentSessionRecord>,
    pub todos: Vec<Todo>,
    pub status: RunStatus,
    pub budget: BudgetSnapshot,
    #[serde(default)]
    pub audits: Vec<AuditRecord>,
    #[serde(default)]
    pub load_warnings: Vec<String>,
    pub config: OrchestratorConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Run {
    pub fn partition(&self, id: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.id == id)
    }

    pub fn partition_mut(&mut self, id: &str) -> Option<&mut Partition> {
        self.partitions.iter_mut().find(|p| p.id == id)
    }

    pub fn agent(&self, id: &str) -> Option<&AgentSessionRecord> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Inserts or replaces the record with the same id.
    pub fn upsert_agent(&mut self, record: AgentSessionRecord) {
        match self.agents.iter_mut().find(|a| a.id == record.id) {
            Some(existing) => *existing = record,
            None => self.agents.push(record),
        }
    }

    pub fn todo_mut(&mut self, id: &str) -> Option<&mut Todo> {
        self.todos.iter_mut().find(|t| t.id == id)
    }

    pub fn todos_in(&self, partition: &Partition) -> Vec<Todo> {
        partition
            .todo_ids
            .iter()
            .filter_map(|id| self.todos.iter().find(|t| &t.id == id).cloned())
            .collect()
    }

    /// `completed` iff every partition completed, `failed` if none did.
    pub fn derive_status(&self) -> RunStatus {
        if self.partitions.iter().any(|p| !p.status.is_terminal()) {
            return RunStatus::Running;
        }
        let completed = self
            .partitions
            .iter()
            .filter(|p| p.status == PartitionStatus::Completed)
            .count();
        if completed == self.partitions.len() {
            RunStatus::Completed
        } else if completed == 0 {
            RunStatus::Failed
        } else {
            RunStatus::PartiallyFailed
        }
    }

    pub fn todo_counts(&self) -> TodoCounts {
        let mut counts = TodoCounts::default();
        for todo in &self.todos {
            match todo.status {
                TodoStatus::Open => counts.open += 1,
                TodoStatus::InProgress => counts.in_progress += 1,
                TodoStatus::Done => counts.done += 1,
                TodoStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TodoCounts {
    pub open: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    RunStarted {
        run_id: String,
        mode: RunMode,
        partitions: usize,
        timestamp: DateTime<Utc>,
    },
    RunResumed {
        run_id: String,
        requeued_todos: usize,
        timestamp: DateTime<Utc>,
    },
    SessionCreated {
        run_id: String,
        session_id: String,
        partition_id: String,
        timestamp: DateTime<Utc>,
    },
    SessionStateChanged {
        run_id: String,
        session_id: String,
        from: AgentState,
        to: AgentState,
        timestamp: DateTime<Utc>,
    },
    ToolCalled {
        run_id: String,
        session_id: String,
        tool: String,
        ok: bool,
        timestamp: DateTime<Utc>,
    },
    AuditCompleted {
        run_id: String,
        session_id: String,
        verdict: Verdict,
        issues: usize,
        retry_count: u32,
        timestamp: DateTime<Utc>,
    },
    BudgetExceeded {
        run_id: String,
        session_id: String,
        scope: BudgetScope,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    TodoStatusChanged {
        run_id: String,
        todo_id: String,
        status: TodoStatus,
        timestamp: DateTime<Utc>,
    },
    PartitionFinished {
        run_id: String,
        partition_id: String,
        status: PartitionStatus,
        timestamp: DateTime<Utc>,
    },
    AbortRequested {
        run_id: String,
        target: String,
        timestamp: DateTime<Utc>,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
        timestamp: DateTime<Utc>,
    },
}
