// Convoy Orchestrator
// Partitions a todo list across agent sessions, audits their completion claims
// and keeps every run resumable from its last snapshot.

pub mod audit;
pub mod budget;
pub mod config;
pub mod engine;
pub mod error;
pub mod prompts;
pub mod session;
pub mod store;
pub mod todo_store;
pub mod types;

pub use audit::{
    verifier_from_config, AuditGate, AuditRequest, ChainVerifier, CommandVerifier, ModelVerifier,
    Verifier,
};
pub use budget::{BudgetExceeded, BudgetGuard, BudgetLedger, BudgetScope, Reservation};
pub use config::{OrchestratorConfig, PricingConfig, VerifierConfig, VerifierKind};
pub use engine::{plan_partitions, AbortTarget, Orchestrator, OrchestratorBuilder, PartitionPlan};
pub use error::{OrchestratorError, Result};
pub use prompts::{VerifierReport, COMPLETION_MARKER};
pub use session::{AgentSession, SessionOutcome};
pub use store::{RunStore, RunSummary};
pub use todo_store::{parse_todos, partition_by_category, LoadedTodos, TodoStore};
pub use types::*;
