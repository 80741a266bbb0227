use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use convoy_orchestrator::{
    parse_todos, AbortTarget, AgentRole, AgentState, AuditRequest, BudgetScope, Orchestrator,
    OrchestratorConfig, OrchestratorError, OrchestratorEvent, PartitionStatus, PricingConfig,
    Result, RunMode, RunStatus, RunStore, Verdict, Verifier, VerifierReport, COMPLETION_MARKER,
};
use convoy_providers::{
    CompletionRequest, CompletionResponse, CompletionService, ProviderError, ScriptedProvider,
    ScriptedReply,
};
use convoy_types::TodoStatus;

// ============================================================================
// Fixtures
// ============================================================================

/// Verdicts queued per partition; an empty queue passes.
#[derive(Default)]
struct ScriptedVerifier {
    verdicts: Mutex<HashMap<String, VecDeque<Verdict>>>,
    calls: AtomicUsize,
}

impl ScriptedVerifier {
    fn with(partition: &str, verdicts: Vec<Verdict>) -> Self {
        let verifier = Self::default();
        verifier
            .verdicts
            .lock()
            .unwrap()
            .insert(partition.to_string(), verdicts.into());
        verifier
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn verify(&self, request: &AuditRequest<'_>, _cancel: CancellationToken) -> Result<VerifierReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let verdict = self
            .verdicts
            .lock()
            .unwrap()
            .get_mut(&request.scope.partition_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Verdict::Pass);
        let issues = match verdict {
            Verdict::Pass => vec![],
            _ => vec![format!("{} is not finished", request.scope.partition_id)],
        };
        Ok(VerifierReport { verdict, issues })
    }
}

fn workspace(todo: &str, dirs: &[&str]) -> TempDir {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("TODO.md"), todo).unwrap();
    for sub in dirs {
        std::fs::create_dir_all(dir.path().join(sub)).unwrap();
    }
    dir
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        pricing: PricingConfig {
            input_per_mtok: 0.0,
            output_per_mtok: 0.0,
        },
        provider_backoff_ms: 1,
        max_output_tokens: 256,
        ..OrchestratorConfig::default()
    }
}

fn write(call: &str, path: &str, content: &str) -> ScriptedReply {
    ScriptedReply::tool(call, "write_file", json!({"path": path, "content": content}))
}

fn claim(note: &str) -> ScriptedReply {
    ScriptedReply::text(format!("{} {}", note, COMPLETION_MARKER))
}

/// Contents of every file under `root`, skipping run state, the todo file
/// and anything under `skip`.
fn tree_contents(root: &Path, skip: &str) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(dir: &Path, root: &Path, skip: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let rel = path.strip_prefix(root).unwrap().to_path_buf();
            if rel.starts_with(".convoy") || rel.starts_with(skip) || rel == Path::new("TODO.md") {
                continue;
            }
            if path.is_dir() {
                walk(&path, root, skip, out);
            } else {
                out.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, Path::new(skip), &mut out);
    out
}

fn todo_statuses(root: &Path) -> HashMap<String, TodoStatus> {
    let content = std::fs::read_to_string(root.join("TODO.md")).unwrap();
    parse_todos(&content)
        .todos
        .into_iter()
        .map(|t| (t.id, t.status))
        .collect()
}

const THREE_CATEGORIES: &str = "# Release\n\n## Backend\n- [ ] {api} Add the health endpoint\n\n## Frontend\n- [ ] {ui} Render the status badge\n\n## Docs\n- [ ] {readme} Document the endpoint\n";

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn parallel_run_completes_every_partition() {
    let ws = workspace(THREE_CATEGORIES, &["backend", "frontend", "docs"]);
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_scope("backend", vec![write("b1", "health.rs", "fn health() {}"), claim("endpoint added")])
            .with_scope("frontend", vec![write("f1", "badge.tsx", "export {}"), claim("badge rendered")])
            .with_scope("docs", vec![write("d1", "health.md", "# Health"), claim("documented")]),
    );
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let orchestrator = Orchestrator::builder(ws.path(), config(), provider.clone())
        .verifier(Arc::new(ScriptedVerifier::default()))
        .events(events_tx)
        .start("Ship the health check", RunMode::ParallelMulti)
        .await
        .unwrap();
    let run = orchestrator.dispatch().await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.partitions.len(), 3);
    assert!(run
        .partitions
        .iter()
        .all(|p| p.status == PartitionStatus::Completed));
    assert!(run.agents.iter().all(|a| a.state == AgentState::Completed));
    assert!(ws.path().join("backend/health.rs").exists());
    assert!(ws.path().join("frontend/badge.tsx").exists());
    assert!(ws.path().join("docs/health.md").exists());

    // Every todo lands in exactly one partition.
    let mut seen = HashSet::new();
    for partition in &run.partitions {
        for id in &partition.todo_ids {
            assert!(seen.insert(id.clone()), "{} assigned twice", id);
        }
    }
    assert_eq!(seen.len(), 3);

    let statuses = todo_statuses(ws.path());
    assert!(statuses.values().all(|s| *s == TodoStatus::Done), "{:?}", statuses);

    let store = RunStore::new(ws.path(), ".convoy").unwrap();
    assert!(store.is_archived(orchestrator.run_id()));
    assert_eq!(store.load_run(orchestrator.run_id()).unwrap().status, RunStatus::Completed);

    let mut created = 0;
    let mut finished = false;
    while let Ok(event) = events_rx.try_recv() {
        match event {
            OrchestratorEvent::SessionCreated { .. } => created += 1,
            OrchestratorEvent::RunFinished { status, .. } => {
                finished = status == RunStatus::Completed
            }
            _ => {}
        }
    }
    assert_eq!(created, 3);
    assert!(finished);
}

#[tokio::test]
async fn write_outside_scope_fails_only_that_session() {
    let todo = "## Backend\n- [ ] {api} Add the endpoint\n## Docs\n- [ ] {readme} Document it\n";
    let ws = workspace(todo, &["backend", "docs"]);
    std::fs::write(ws.path().join("backend/main.rs"), "fn main() {}").unwrap();
    std::fs::write(ws.path().join("Cargo.toml"), "[package]\nname = \"app\"\n").unwrap();
    let before = tree_contents(ws.path(), "docs");
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_scope("backend", vec![write("b1", "api.rs", "pub fn api() {}"), claim("done")])
            .with_scope("docs", vec![write("d1", "../backend/main.rs", "// overwritten"), claim("done")]),
    );

    let orchestrator = Orchestrator::builder(ws.path(), config(), provider)
        .verifier(Arc::new(ScriptedVerifier::default()))
        .start("Endpoint and docs", RunMode::ParallelMulti)
        .await
        .unwrap();
    let run = orchestrator.dispatch().await.unwrap();

    assert_eq!(run.status, RunStatus::PartiallyFailed);
    assert_eq!(
        std::fs::read_to_string(ws.path().join("backend/main.rs")).unwrap(),
        "fn main() {}"
    );
    assert!(ws.path().join("backend/api.rs").exists());
    let mut after = tree_contents(ws.path(), "docs");
    after.remove(Path::new("backend/api.rs"));
    assert_eq!(after, before);

    let docs = run.agents.iter().find(|a| a.partition_id == "docs").unwrap();
    assert_eq!(docs.state, AgentState::Failed);
    assert!(docs
        .failure_reason
        .as_deref()
        .unwrap()
        .starts_with("Permission denied"));
    assert!(docs.touched_paths.is_empty());

    let statuses = todo_statuses(ws.path());
    assert_eq!(statuses["api"], TodoStatus::Done);
    assert_eq!(statuses["readme"], TodoStatus::Failed);
}

#[tokio::test]
async fn parallel_workers_cannot_shell_out_of_their_scope() {
    let todo = "## Alpha\n- [ ] {a} Alpha work\n## Beta\n- [ ] {b} Beta work\n";
    let ws = workspace(todo, &["alpha", "beta"]);
    let escape = ScriptedReply::tool(
        "x1",
        "run_command",
        json!({"command": "echo pwned > ../beta/x.rs && echo pwned >> ../TODO.md"}),
    );
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_scope("alpha", vec![escape, claim("alpha done")])
            .with_scope("beta", vec![claim("beta done")]),
    );
    let config = OrchestratorConfig {
        allow_commands: true,
        ..config()
    };

    let orchestrator = Orchestrator::builder(ws.path(), config, provider.clone())
        .verifier(Arc::new(ScriptedVerifier::default()))
        .start("Alpha and beta", RunMode::ParallelMulti)
        .await
        .unwrap();
    let run = orchestrator.dispatch().await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(!ws.path().join("beta/x.rs").exists());
    assert!(!std::fs::read_to_string(ws.path().join("TODO.md"))
        .unwrap()
        .contains("pwned"));
    let alpha = run.agents.iter().find(|a| a.partition_id == "alpha").unwrap();
    assert!(!alpha.allowed_tools.iter().any(|t| t == "run_command"));
    assert!(alpha
        .conversation_history
        .iter()
        .any(|m| m.tool_call_id.as_deref() == Some("x1") && m.content.contains("not available")));
    let requests = provider.requests();
    assert!(requests
        .iter()
        .all(|r| r.tools.iter().all(|t| t.name != "run_command")));
}

#[tokio::test]
async fn review_categories_run_read_only() {
    let todo = "## Api\n- [ ] {impl} Implement it\n## Review\n- [ ] {check} Review the api\n";
    let ws = workspace(todo, &["api", "review"]);
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_scope("api", vec![write("a1", "lib.rs", "pub fn api() {}"), claim("implemented")])
            .with_scope(
                "review",
                vec![write("r1", "notes.md", "looks fine"), claim("reviewed")],
            ),
    );
    let config = OrchestratorConfig {
        review_categories: vec!["review".to_string()],
        allow_commands: true,
        ..config()
    };

    let orchestrator = Orchestrator::builder(ws.path(), config, provider)
        .verifier(Arc::new(ScriptedVerifier::default()))
        .start("Implement and review", RunMode::SequentialMulti)
        .await
        .unwrap();
    let run = orchestrator.dispatch().await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let api = run.agents.iter().find(|a| a.partition_id == "api").unwrap();
    assert_eq!(api.role, AgentRole::Worker);
    assert!(api.allowed_tools.iter().any(|t| t == "run_command"));
    let review = run.agents.iter().find(|a| a.partition_id == "review").unwrap();
    assert_eq!(review.role, AgentRole::Supervisor);
    assert!(!review
        .allowed_tools
        .iter()
        .any(|t| t == "write_file" || t == "run_command"));
    assert!(!ws.path().join("review/notes.md").exists());
}

#[tokio::test]
async fn audit_failures_escalate_at_retry_limit() {
    let ws = workspace("- [ ] {fix} Fix the flaky test\n", &[]);
    let provider = Arc::new(ScriptedProvider::new().with_default(vec![
        claim("fixed"),
        claim("fixed again"),
        claim("really fixed"),
        claim("definitely fixed"),
        claim("never reached"),
    ]));
    let verifier = Arc::new(ScriptedVerifier::with("all", vec![Verdict::Fail; 10]));
    let config = OrchestratorConfig {
        retry_limit: 3,
        ..config()
    };

    let orchestrator = Orchestrator::builder(ws.path(), config, provider.clone())
        .verifier(verifier.clone())
        .start("Stabilise CI", RunMode::Single)
        .await
        .unwrap();
    let run = orchestrator.dispatch().await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let agent = &run.agents[0];
    assert_eq!(agent.state, AgentState::Failed);
    assert_eq!(agent.retry_count, 3);
    assert_eq!(verifier.calls(), 4);
    assert_eq!(provider.call_count(), 4);
    assert_eq!(
        run.audits.iter().map(|a| a.verdict).collect::<Vec<_>>(),
        vec![Verdict::Fail, Verdict::Fail, Verdict::Fail, Verdict::Escalate]
    );
    assert!(agent.issues.iter().any(|i| i.contains("retry limit")));
    assert_eq!(todo_statuses(ws.path())["fix"], TodoStatus::Failed);
}

#[tokio::test]
async fn session_budget_stops_one_session_and_keeps_its_work() {
    let todo = "## Alpha\n- [ ] {a1} Generate fixtures\n## Beta\n- [ ] {b1} Small fix\n";
    let ws = workspace(todo, &["alpha", "beta"]);
    let alpha = (0..5)
        .map(|i| write(&format!("a{}", i), &format!("f{}.txt", i), "data").costing(0.05))
        .collect();
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_scope("alpha", alpha)
            .with_scope("beta", vec![write("b1", "fix.txt", "ok").costing(0.01), claim("fixed").costing(0.01)]),
    );
    let config = OrchestratorConfig {
        max_session_cost: Some(0.12),
        ..config()
    };
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let orchestrator = Orchestrator::builder(ws.path(), config, provider.clone())
        .verifier(Arc::new(ScriptedVerifier::default()))
        .events(events_tx)
        .start("Two small jobs", RunMode::ParallelMulti)
        .await
        .unwrap();
    let run = orchestrator.dispatch().await.unwrap();

    assert_eq!(run.status, RunStatus::PartiallyFailed);
    let alpha = run.agents.iter().find(|a| a.partition_id == "alpha").unwrap();
    assert_eq!(alpha.state, AgentState::Failed);
    assert!(alpha.failure_reason.as_deref().unwrap().contains("budget exceeded"));
    assert_eq!(provider.remaining("alpha"), 2);
    assert!(ws.path().join("alpha/f0.txt").exists());
    assert!(ws.path().join("alpha/f1.txt").exists());
    assert!(!ws.path().join("alpha/f2.txt").exists());
    assert_eq!(alpha.touched_paths.len(), 2);
    // The third call is charged only up to the cap.
    assert!(alpha.cost_spent <= 0.12 + 1e-9);
    assert!((alpha.cost_spent - 0.12).abs() < 1e-9);

    let beta = run.agents.iter().find(|a| a.partition_id == "beta").unwrap();
    assert_eq!(beta.state, AgentState::Completed);

    let mut session_scoped = false;
    while let Ok(event) = events_rx.try_recv() {
        if let OrchestratorEvent::BudgetExceeded { scope, .. } = event {
            session_scoped = scope == BudgetScope::Session;
        }
    }
    assert!(session_scoped);
}

#[tokio::test]
async fn run_budget_exhaustion_cancels_pending_partitions() {
    let todo = "## First\n- [ ] {one} Step one\n## Second\n- [ ] {two} Step two\n";
    let ws = workspace(todo, &["first", "second"]);
    let provider = Arc::new(ScriptedProvider::new().with_scope(
        "first",
        vec![
            write("c1", "a.txt", "a").costing(0.06),
            write("c2", "b.txt", "b").costing(0.06),
            claim("done"),
        ],
    ));
    let config = OrchestratorConfig {
        max_cost: 0.10,
        ..config()
    };

    let orchestrator = Orchestrator::builder(ws.path(), config, provider.clone())
        .verifier(Arc::new(ScriptedVerifier::default()))
        .start("Two steps", RunMode::SequentialMulti)
        .await
        .unwrap();
    let run = orchestrator.dispatch().await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(provider.call_count(), 2);
    assert!(run.budget.exhausted);
    assert!((run.budget.spent - 0.10).abs() < 1e-9);
    assert!(run.agents.iter().all(|a| a.partition_id == "first"));

    let statuses = todo_statuses(ws.path());
    assert_eq!(statuses["one"], TodoStatus::Failed);
    assert_eq!(statuses["two"], TodoStatus::Failed);
}

#[tokio::test]
async fn overlapping_reservations_wait_rather_than_exhaust_the_run() {
    let todo = "## Left\n- [ ] {l} Left work\n## Right\n- [ ] {r} Right work\n";
    let ws = workspace(todo, &["left", "right"]);
    let reply = |note: &str| {
        ScriptedReply::delayed(Duration::from_millis(100), claim(note).costing(0.01))
    };
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_scope("left", vec![reply("left done")])
            .with_scope("right", vec![reply("right done")]),
    );
    // Each call reserves $0.60 up front against a $1.00 run cap.
    let config = OrchestratorConfig {
        max_cost: 1.0,
        max_output_tokens: 250,
        pricing: PricingConfig {
            input_per_mtok: 0.0,
            output_per_mtok: 2400.0,
        },
        ..config()
    };
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let orchestrator = Orchestrator::builder(ws.path(), config, provider.clone())
        .verifier(Arc::new(ScriptedVerifier::default()))
        .events(events_tx)
        .start("Both sides", RunMode::ParallelMulti)
        .await
        .unwrap();
    let run = orchestrator.dispatch().await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(!run.budget.exhausted);
    assert!((run.budget.spent - 0.02).abs() < 1e-9);
    assert_eq!(provider.call_count(), 2);
    assert!(run.agents.iter().all(|a| a.state == AgentState::Completed));
    let budget_events = std::iter::from_fn(|| events_rx.try_recv().ok())
        .filter(|e| matches!(e, OrchestratorEvent::BudgetExceeded { .. }))
        .count();
    assert_eq!(budget_events, 0);
}

#[tokio::test]
async fn priced_calls_never_spend_past_the_run_cap() {
    let todo = "- [ ] {t1} One\n- [ ] {t2} Two\n- [ ] {t3} Three\n- [ ] {t4} Four\n- [ ] {t5} Five\n";
    let ws = workspace(todo, &[]);
    let mut replies: Vec<_> = (1..=5)
        .map(|i| write(&format!("w{}", i), &format!("t{}.txt", i), "done").costing(0.30))
        .collect();
    replies.push(claim("all five"));
    let provider = Arc::new(ScriptedProvider::new().with_default(replies));
    // Estimates are $0.25 a call; each call actually costs $0.30.
    let config = OrchestratorConfig {
        max_cost: 1.0,
        max_output_tokens: 250,
        pricing: PricingConfig {
            input_per_mtok: 0.0,
            output_per_mtok: 1000.0,
        },
        ..config()
    };
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let orchestrator = Orchestrator::builder(ws.path(), config, provider.clone())
        .verifier(Arc::new(ScriptedVerifier::default()))
        .events(events_tx)
        .start("Five todos", RunMode::Single)
        .await
        .unwrap();
    let run = orchestrator.dispatch().await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.budget.spent <= run.budget.max_cost + 1e-9);
    assert!((run.budget.spent - 0.90).abs() < 1e-9);
    assert_eq!(provider.call_count(), 3);
    let agent = &run.agents[0];
    assert!(agent.cost_spent <= 1.0 + 1e-9);
    assert!(agent.failure_reason.as_deref().unwrap().contains("budget exceeded"));
    assert!(ws.path().join("t3.txt").exists());
    assert!(!ws.path().join("t4.txt").exists());
    assert!(std::iter::from_fn(|| events_rx.try_recv().ok())
        .any(|e| matches!(e, OrchestratorEvent::BudgetExceeded { .. })));
}

#[tokio::test]
async fn sequential_sessions_receive_a_handoff() {
    let todo = "## Api\n- [ ] {health} Add /health\n## Docs\n- [ ] {doc} Document /health\n";
    let ws = workspace(todo, &["api", "docs"]);
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_scope("api", vec![write("a1", "health.rs", "fn health() {}"), claim("Added /health returning 200.")])
            .with_scope("docs", vec![claim("Documented.")]),
    );

    let orchestrator = Orchestrator::builder(ws.path(), config(), provider.clone())
        .verifier(Arc::new(ScriptedVerifier::default()))
        .start("Health check", RunMode::SequentialMulti)
        .await
        .unwrap();
    let run = orchestrator.dispatch().await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let requests = provider.requests();
    let api_prompt = &requests.iter().find(|r| r.scope == "api").unwrap().system_prompt;
    let docs_prompt = &requests.iter().find(|r| r.scope == "docs").unwrap().system_prompt;
    assert!(!api_prompt.contains("Handoff From Previous Agent"));
    assert!(docs_prompt.contains("Handoff From Previous Agent"));
    assert!(docs_prompt.contains("Partition: api"));
    assert!(docs_prompt.contains("Added /health returning 200."));
}

#[tokio::test]
async fn interrupted_run_resumes_with_its_history() {
    let ws = workspace("## Api\n- [ ] {health} Add /health\n", &["api"]);
    let first = Arc::new(ScriptedProvider::new().with_scope(
        "api",
        vec![
            write("a1", "health.rs", "fn health() {}"),
            ScriptedReply::delayed(Duration::from_secs(30), claim("too late")),
        ],
    ));
    let orchestrator = Orchestrator::builder(ws.path(), config(), first)
        .verifier(Arc::new(ScriptedVerifier::default()))
        .start("Health check", RunMode::SequentialMulti)
        .await
        .unwrap();
    let run_id = orchestrator.run_id().to_string();

    let running = orchestrator.clone();
    let handle = tokio::spawn(async move { running.dispatch().await });
    let store = RunStore::new(ws.path(), ".convoy").unwrap();
    let mut persisted = false;
    for _ in 0..500 {
        if let Ok(run) = store.load_run(&run_id) {
            if run.agents.first().map_or(false, |a| a.conversation_history.len() >= 3) {
                persisted = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(persisted, "first tool round was never persisted");
    // Simulate the process dying mid-call.
    handle.abort();
    let _ = handle.await;
    assert_eq!(todo_statuses(ws.path())["health"], TodoStatus::InProgress);

    let second = Arc::new(ScriptedProvider::new().with_scope("api", vec![claim("Added /health.")]));
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let resumed = Orchestrator::builder(ws.path(), config(), second.clone())
        .verifier(Arc::new(ScriptedVerifier::default()))
        .events(events_tx)
        .resume(&run_id)
        .await
        .unwrap();
    let run = resumed.dispatch().await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.agents.len(), 1);
    let agent = &run.agents[0];
    assert_eq!(agent.state, AgentState::Completed);
    assert!(agent
        .conversation_history
        .iter()
        .any(|m| m.tool_call_id.as_deref() == Some("a1")));
    // The resumed call carries the earlier conversation.
    assert!(second.requests()[0].messages.len() >= 3);
    assert_eq!(todo_statuses(ws.path())["health"], TodoStatus::Done);

    let requeued = std::iter::from_fn(|| events_rx.try_recv().ok()).find_map(|e| match e {
        OrchestratorEvent::RunResumed { requeued_todos, .. } => Some(requeued_todos),
        _ => None,
    });
    assert_eq!(requeued, Some(1));

    let again = Orchestrator::builder(ws.path(), config(), second)
        .resume(&run_id)
        .await;
    assert!(matches!(again, Err(OrchestratorError::Validation(_))));
}

#[tokio::test]
async fn resume_rejects_a_snapshot_with_an_invalid_config() {
    let ws = workspace("## Api\n- [ ] {health} Add /health\n", &["api"]);
    let provider = Arc::new(ScriptedProvider::new());
    let orchestrator = Orchestrator::builder(ws.path(), config(), provider.clone())
        .verifier(Arc::new(ScriptedVerifier::default()))
        .start("Health check", RunMode::SequentialMulti)
        .await
        .unwrap();
    let run_id = orchestrator.run_id().to_string();
    drop(orchestrator);

    let store = RunStore::new(ws.path(), ".convoy").unwrap();
    let mut run = store.load_run(&run_id).unwrap();
    run.config.max_concurrency = 0;
    store.save_run(&run).unwrap();

    let resumed = Orchestrator::builder(ws.path(), config(), provider.clone())
        .verifier(Arc::new(ScriptedVerifier::default()))
        .resume(&run_id)
        .await;
    assert!(matches!(resumed, Err(OrchestratorError::Validation(_))));
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn aborting_one_session_leaves_siblings_running() {
    let todo = "## Slow\n- [ ] {s} Slow work\n## Fast\n- [ ] {f} Fast work\n";
    let ws = workspace(todo, &["slow", "fast"]);
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_scope(
                "slow",
                vec![ScriptedReply::delayed(Duration::from_secs(30), claim("slow done"))],
            )
            .with_scope(
                "fast",
                vec![ScriptedReply::delayed(Duration::from_millis(200), claim("fast done"))],
            ),
    );
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::builder(ws.path(), config(), provider)
        .verifier(Arc::new(ScriptedVerifier::default()))
        .events(events_tx)
        .start("Mixed", RunMode::ParallelMulti)
        .await
        .unwrap();

    let running = orchestrator.clone();
    let handle = tokio::spawn(async move { running.dispatch().await });

    let slow_session = loop {
        match tokio::time::timeout(Duration::from_secs(5), events_rx.recv()).await {
            Ok(Some(OrchestratorEvent::SessionCreated {
                session_id,
                partition_id,
                ..
            })) if partition_id == "slow" => break session_id,
            Ok(Some(_)) => continue,
            other => panic!("no session created for `slow`: {:?}", other),
        }
    };
    orchestrator
        .abort(AbortTarget::Session(slow_session.clone()))
        .await
        .unwrap();

    let run = handle.await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::PartiallyFailed);
    let slow = run.agents.iter().find(|a| a.id == slow_session).unwrap();
    assert_eq!(slow.state, AgentState::Failed);
    assert!(slow.failure_reason.as_deref().unwrap().starts_with("Cancelled"));
    let fast = run.agents.iter().find(|a| a.partition_id == "fast").unwrap();
    assert_eq!(fast.state, AgentState::Completed);

    assert!(matches!(
        orchestrator.abort(AbortTarget::Session("agent-missing".into())).await,
        Err(OrchestratorError::NotFound(_))
    ));
}

#[tokio::test]
async fn overlapping_parallel_scopes_are_rejected_before_anything_runs() {
    let ws = workspace("## Api\n- [ ] a\n## Web\n- [ ] b\n", &[]);
    let provider = Arc::new(ScriptedProvider::new());
    let result = Orchestrator::builder(ws.path(), config(), provider.clone())
        .verifier(Arc::new(ScriptedVerifier::default()))
        .start("Overlap", RunMode::ParallelMulti)
        .await;
    assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    assert_eq!(provider.call_count(), 0);
    assert!(!ws.path().join(".convoy").exists());
}

#[tokio::test]
async fn empty_todo_list_completes_immediately() {
    let ws = workspace("# Nothing left\n- [x] {done} Already shipped\n", &[]);
    let provider = Arc::new(ScriptedProvider::new());
    let orchestrator = Orchestrator::builder(ws.path(), config(), provider.clone())
        .verifier(Arc::new(ScriptedVerifier::default()))
        .start("Idle", RunMode::SequentialMulti)
        .await
        .unwrap();
    let run = orchestrator.dispatch().await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.partitions.is_empty());
    assert_eq!(provider.call_count(), 0);
}

// ============================================================================
// Concurrency
// ============================================================================

/// Tracks how many calls are in flight overall and per agent.
struct GaugeProvider {
    inner: ScriptedProvider,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    per_agent: Mutex<HashMap<String, usize>>,
    agent_overlap: AtomicUsize,
}

#[async_trait]
impl CompletionService for GaugeProvider {
    fn name(&self) -> &str {
        "gauge"
    }

    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<CompletionResponse, ProviderError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        {
            let mut per_agent = self.per_agent.lock().unwrap();
            let count = per_agent.entry(request.agent_id.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                self.agent_overlap.fetch_add(1, Ordering::SeqCst);
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = self.inner.complete(request.clone(), cancel).await;
        if let Some(count) = self.per_agent.lock().unwrap().get_mut(&request.agent_id) {
            *count -= 1;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_mode_respects_max_concurrency() {
    let categories = ["one", "two", "three", "four", "five"];
    let todo = categories
        .iter()
        .map(|c| format!("## {}\n- [ ] {{{}-task}} Work on {}\n", c, c, c))
        .collect::<String>();
    let ws = workspace(&todo, &categories);
    let inner = categories.iter().fold(ScriptedProvider::new(), |provider, c| {
        provider.with_scope(
            *c,
            vec![
                write(&format!("{}-1", c), "out.txt", c),
                write(&format!("{}-2", c), "more.txt", c),
                claim("done"),
            ],
        )
    });
    let provider = Arc::new(GaugeProvider {
        inner,
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
        per_agent: Mutex::new(HashMap::new()),
        agent_overlap: AtomicUsize::new(0),
    });
    let config = OrchestratorConfig {
        max_concurrency: 2,
        ..config()
    };

    let orchestrator = Orchestrator::builder(ws.path(), config, provider.clone())
        .verifier(Arc::new(ScriptedVerifier::default()))
        .start("Fan out", RunMode::ParallelMulti)
        .await
        .unwrap();
    let run = orchestrator.dispatch().await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 2);
    assert_eq!(provider.agent_overlap.load(Ordering::SeqCst), 0);
    for c in categories {
        assert_eq!(std::fs::read_to_string(ws.path().join(c).join("out.txt")).unwrap(), c);
    }
}
