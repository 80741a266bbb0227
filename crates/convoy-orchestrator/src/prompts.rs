// Agent Prompts
// System prompts, retry/handoff messages and verifier verdict parsing

use std::path::PathBuf;

use convoy_types::{MessageRole, Todo, TodoStatus};

use crate::types::{AgentRole, AgentSessionRecord, AuditScope, Verdict};

/// Text an agent emits (with no tool calls) to claim its todos are finished.
pub const COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";

pub fn contains_completion_marker(text: &str) -> bool {
    text.contains(COMPLETION_MARKER)
}

fn bullet_list<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let lines = items
        .into_iter()
        .map(|item| format!("- {}", item.as_ref()))
        .collect::<Vec<_>>();
    if lines.is_empty() {
        "- (none)".to_string()
    } else {
        lines.join("\n")
    }
}

fn todo_lines(todos: &[Todo]) -> String {
    bullet_list(
        todos
            .iter()
            .map(|t| format!("[{}] {}: {}", t.status, t.id, t.text)),
    )
}

pub struct SystemPromptInput<'a> {
    pub role: AgentRole,
    pub task_description: &'a str,
    pub partition_category: &'a str,
    pub todos: &'a [Todo],
    pub allowed_paths: &'a [PathBuf],
    pub tool_names: &'a [String],
    pub handoff: Option<&'a str>,
}

pub fn build_system_prompt(input: &SystemPromptInput<'_>) -> String {
    let role_line = match input.role {
        AgentRole::Single => "You are the only agent working through this todo list.",
        AgentRole::Worker => "You are one of several agents; you own exactly the todos listed below.",
        AgentRole::Supervisor => {
            "You are a supervising agent. You may inspect files but not change them."
        }
    };
    let handoff_section = input
        .handoff
        .filter(|h| !h.trim().is_empty())
        .map(|h| format!("\n## Handoff From Previous Agent\n{}\n", h.trim()))
        .unwrap_or_default();

    format!(
        r#"{role_line}

## Overall Task
{task}

## Your Todos ({category})
{todos}

## Allowed Paths
{paths}
Anything outside these paths is off limits and will be rejected.

## Tools
{tools}
{handoff_section}
## Rules
- Work on your todos only, one tool call at a time.
- Use update_todo_status to record progress as you go.
- When every todo is finished, reply with no tool calls and include {marker}.
- Your work is reviewed after you claim completion; issues found are sent back to you."#,
        role_line = role_line,
        task = input.task_description.trim(),
        category = input.partition_category,
        todos = todo_lines(input.todos),
        paths = bullet_list(input.allowed_paths.iter().map(|p| p.display().to_string())),
        tools = bullet_list(input.tool_names),
        handoff_section = handoff_section,
        marker = COMPLETION_MARKER,
    )
}

pub fn build_kickoff_message(todos: &[Todo]) -> String {
    format!(
        "Start working on your todos:\n{}\n\nReply with {} once all of them are done.",
        todo_lines(todos),
        COMPLETION_MARKER
    )
}

pub fn build_continue_nudge() -> String {
    format!(
        "Continue with your todos using the available tools. If everything is finished, reply with {}.",
        COMPLETION_MARKER
    )
}

pub fn build_retry_message(issues: &[String], attempt: u32, retry_limit: u32) -> String {
    format!(
        "Review found problems with your work (retry {} of {}):\n{}\n\nFix these issues, then claim completion again with {}.",
        attempt,
        retry_limit,
        bullet_list(issues),
        COMPLETION_MARKER
    )
}

/// Compact summary of a finished session passed to the next one in
/// sequential mode. Truncated to `max_chars`.
pub fn build_handoff_summary(record: &AgentSessionRecord, todos: &[Todo], max_chars: usize) -> String {
    let done = todos
        .iter()
        .filter(|t| t.status == TodoStatus::Done)
        .map(|t| t.id.as_str())
        .collect::<Vec<_>>();
    let touched = record
        .touched_paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>();
    let last_words = record
        .last_claim
        .clone()
        .or_else(|| {
            record
                .conversation_history
                .iter()
                .rev()
                .find(|m| m.role == MessageRole::Assistant && !m.content.trim().is_empty())
                .map(|m| m.content.clone())
        })
        .unwrap_or_default()
        .replace(COMPLETION_MARKER, "");
    let mut summary = format!(
        "Partition: {}\nOutcome: {}\nDone: {}\nFiles changed: {}\nNotes: {}",
        record.partition_id,
        record.state.as_str(),
        if done.is_empty() { "none".to_string() } else { done.join(", ") },
        if touched.is_empty() { "none".to_string() } else { touched.join(", ") },
        last_words.trim()
    );
    if summary.chars().count() > max_chars {
        summary = summary.chars().take(max_chars).collect();
    }
    summary
}

pub fn build_verifier_prompt(
    scope: &AuditScope,
    todos: &[Todo],
    touched_paths: &[PathBuf],
    claim: &str,
) -> String {
    format!(
        r#"You are reviewing an agent's claim that its todos are complete.

## Partition
{partition}

## Todos Under Review
{todos}

## Files The Agent Changed
{touched}

## Agent's Claim
{claim}

## Output Format
Output ONLY a JSON object:
```json
{{
  "verdict": "pass" | "fail" | "escalate",
  "issues": ["specific problem", "..."]
}}
```
Use "fail" for fixable problems, "escalate" when the work cannot succeed without a human."#,
        partition = scope.partition_id,
        todos = todo_lines(todos),
        touched = bullet_list(touched_paths.iter().map(|p| p.display().to_string())),
        claim = claim.replace(COMPLETION_MARKER, "").trim(),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifierReport {
    pub verdict: Verdict,
    pub issues: Vec<String>,
}

fn json_candidates(output: &str) -> Vec<String> {
    let mut out = Vec::new();
    for fence in ["```json", "```"] {
        if let Some(start) = output.find(fence) {
            let after = &output[start + fence.len()..];
            if let Some(end) = after.find("```") {
                let block = after[..end].trim();
                if !block.is_empty() {
                    out.push(block.to_string());
                }
            }
        }
    }
    if let (Some(start), Some(end)) = (output.find('{'), output.rfind('}')) {
        if start <= end {
            out.push(output[start..=end].to_string());
        }
    }
    out
}

pub fn parse_verdict_strict(output: &str) -> Result<VerifierReport, String> {
    #[derive(serde::Deserialize)]
    struct RawVerdict {
        #[serde(default)]
        verdict: Option<Verdict>,
        #[serde(default)]
        passed: Option<bool>,
        #[serde(default)]
        issues: Vec<String>,
    }

    let candidates = std::iter::once(output.trim().to_string()).chain(json_candidates(output));
    for candidate in candidates {
        let Ok(raw) = serde_json::from_str::<RawVerdict>(&candidate) else {
            continue;
        };
        let verdict = match (raw.verdict, raw.passed) {
            (Some(verdict), _) => verdict,
            (None, Some(true)) => Verdict::Pass,
            (None, Some(false)) => Verdict::Fail,
            (None, None) => continue,
        };
        let mut issues = raw.issues;
        if verdict != Verdict::Pass && issues.is_empty() {
            issues.push("verifier rejected the work without details".to_string());
        }
        return Ok(VerifierReport { verdict, issues });
    }
    Err("verifier response did not contain a verdict object".to_string())
}

pub fn parse_verdict_fallback(output: &str) -> Option<VerifierReport> {
    let lower = output.to_lowercase();
    let verdict = if lower.contains("escalate") {
        Verdict::Escalate
    } else if lower.contains("verdict: fail")
        || lower.contains("not complete")
        || lower.contains("missing")
        || (lower.contains("fail") && !lower.contains("no fail"))
    {
        Verdict::Fail
    } else if lower.contains("pass") || lower.contains("looks good") || lower.contains("lgtm") {
        Verdict::Pass
    } else {
        return None;
    };
    let issues = if verdict == Verdict::Pass {
        Vec::new()
    } else {
        vec![output.lines().take(6).collect::<Vec<_>>().join(" ").trim().to_string()]
    };
    Some(VerifierReport { verdict, issues })
}

/// Strict JSON first, then keyword inference. `None` means unusable output.
pub fn parse_verdict(output: &str) -> Option<VerifierReport> {
    parse_verdict_strict(output)
        .ok()
        .or_else(|| parse_verdict_fallback(output))
}
