// Convoy Tools
// Tool contract, the closed registry of built-in handlers and per-session tool sets

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use convoy_types::{ToolCall, ToolOutput, ToolSchema};

mod builtin;
mod sandbox;
mod todo_view;

pub use builtin::{
    ListFilesTool, ListTodosTool, ReadFileTool, RunCommandTool, UpdateTodoStatusTool,
    WriteFileTool,
};
pub use sandbox::RestrictedFileSystem;
pub use todo_view::SessionTodos;

pub const READ_FILE: &str = "read_file";
pub const WRITE_FILE: &str = "write_file";
pub const LIST_FILES: &str = "list_files";
pub const RUN_COMMAND: &str = "run_command";
pub const UPDATE_TODO_STATUS: &str = "update_todo_status";
pub const LIST_TODOS: &str = "list_todos";

pub const BUILTIN_TOOLS: [&str; 6] = [
    READ_FILE,
    WRITE_FILE,
    LIST_FILES,
    RUN_COMMAND,
    UPDATE_TODO_STATUS,
    LIST_TODOS,
];

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ToolError {
    /// Path outside the session's roots, a protected path, or a closed handle.
    #[error("permission denied: {0}")]
    Permission(String),

    #[error("invalid arguments for `{tool}`: {reason}")]
    InvalidArgs { tool: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{message}")]
    Execution { message: String, retryable: bool },

    #[error("tool timed out after {0:?}")]
    Timeout(Duration),

    /// The tool exists but is not in the session's allow-list.
    #[error("tool `{0}` is not available to this session")]
    NotAllowed(String),

    #[error("tool call cancelled")]
    Cancelled,

    #[error("tool configuration error: {0}")]
    Config(String),
}

impl ToolError {
    /// Whether the error can be reported back to the model for another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ToolError::InvalidArgs { .. } | ToolError::NotFound(_) | ToolError::NotAllowed(_) => {
                true
            }
            ToolError::Execution { retryable, .. } => *retryable,
            ToolError::Permission(_)
            | ToolError::Timeout(_)
            | ToolError::Cancelled
            | ToolError::Config(_) => false,
        }
    }

    pub fn invalid_args(tool: &str, reason: impl Into<String>) -> Self {
        ToolError::InvalidArgs {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }
}

/// Everything a handler may touch for one session.
#[derive(Clone)]
/// Everything a handler may touch. Handlers get no other access to the
/// workspace or the run.
pub struct ToolContext {
    pub agent_id: String,
    pub fs: Arc<RestrictedFileSystem>,
    pub todos: Arc<SessionTodos>,
    pub cancel: CancellationToken,
    pub command_timeout: Duration,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError>;
}

/// Closed table of known handlers. Sessions never look tools up here directly;
/// they get a [`ToolSet`] resolved against their allow-list.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn builtin() -> Self {
        let mut tools: BTreeMap<String, Arc<dyn Tool>> = BTreeMap::new();
        tools.insert(READ_FILE.to_string(), Arc::new(ReadFileTool));
        tools.insert(WRITE_FILE.to_string(), Arc::new(WriteFileTool));
        tools.insert(LIST_FILES.to_string(), Arc::new(ListFilesTool));
        tools.insert(RUN_COMMAND.to_string(), Arc::new(RunCommandTool));
        tools.insert(UPDATE_TODO_STATUS.to_string(), Arc::new(UpdateTodoStatusTool));
        tools.insert(LIST_TODOS.to_string(), Arc::new(ListTodosTool));
        Self { tools }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let schema = tool.schema();
        validate_tool_schema(&schema)?;
        if self.tools.contains_key(&schema.name) {
            return Err(ToolError::Config(format!(
                "tool `{}` is already registered",
                schema.name
            )));
        }
        self.tools.insert(schema.name, tool);
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.schema()).collect()
    }

    /// Builds the tool set for one session. Unknown names are a configuration
    /// error so a bad allow-list fails before the session starts.
    pub fn resolve(&self, allowed: &[String]) -> Result<ToolSet, ToolError> {
        let mut tools = BTreeMap::new();
        for name in allowed {
            let Some(tool) = self.tools.get(name) else {
                return Err(ToolError::Config(format!("unknown tool `{}`", name)));
            };
            tools.insert(name.clone(), tool.clone());
        }
        Ok(ToolSet { tools })
    }
}

#[derive(Clone)]
pub struct ToolSet {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.schema()).collect()
    }

    pub async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        if ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        let Some(tool) = self.tools.get(&call.name) else {
            return Err(ToolError::NotAllowed(call.name.clone()));
        };
        tracing::debug!(agent_id = %ctx.agent_id, tool = %call.name, "executing tool call");
        tool.execute(ctx, call.args.clone()).await
    }
}

/// Checks the parts of a JSON schema the completion side relies on: an object
/// root, typed properties, and `required` entries that name real properties.
pub fn validate_tool_schema(schema: &ToolSchema) -> Result<(), ToolError> {
    let invalid = |reason: String| {
        ToolError::Config(format!("invalid schema for `{}`: {}", schema.name, reason))
    };
    if schema.name.trim().is_empty() {
        return Err(invalid("name is empty".into()));
    }
    let root = &schema.input_schema;
    if root.get("type").and_then(Value::as_str) != Some("object") {
        return Err(invalid("root must be an object schema".into()));
    }
    let properties = root
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    for (key, child) in &properties {
        if child.get("type").and_then(Value::as_str).is_none() {
            return Err(invalid(format!("property `{}` has no type", key)));
        }
        if child.get("type").and_then(Value::as_str) == Some("array") && child.get("items").is_none()
        {
            return Err(invalid(format!("array property `{}` is missing items", key)));
        }
    }
    if let Some(required) = root.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !properties.contains_key(name) {
                return Err(invalid(format!("required property `{}` is not declared", name)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn builtin_schemas_are_unique_and_valid() {
        let registry = ToolRegistry::builtin();
        let schemas = registry.schemas();
        for schema in &schemas {
            validate_tool_schema(schema).unwrap();
        }
        let names = schemas.iter().map(|s| s.name.as_str()).collect::<HashSet<_>>();
        assert_eq!(names.len(), BUILTIN_TOOLS.len());
        for name in BUILTIN_TOOLS {
            assert!(names.contains(name), "missing builtin {}", name);
        }
    }

    #[test]
    fn validator_rejects_array_without_items() {
        let schema = ToolSchema {
            name: "bad".into(),
            description: "bad".into(),
            input_schema: json!({"type":"object","properties":{"todos":{"type":"array"}}}),
        };
        let err = validate_tool_schema(&schema).unwrap_err();
        assert!(err.to_string().contains("todos"));
    }

    #[test]
    fn resolve_rejects_unknown_tools() {
        let registry = ToolRegistry::builtin();
        let err = registry
            .resolve(&["read_file".to_string(), "web_search".to_string()])
            .err()
            .unwrap();
        assert_eq!(err, ToolError::Config("unknown tool `web_search`".into()));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ToolRegistry::builtin();
        let err = registry.register(Arc::new(ReadFileTool)).unwrap_err();
        assert!(matches!(err, ToolError::Config(_)));
    }

    #[tokio::test]
    async fn tool_outside_the_set_is_not_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let set = ToolRegistry::builtin()
            .resolve(&[READ_FILE.to_string()])
            .unwrap();
        let ctx = ToolContext {
            agent_id: "agent-1".into(),
            fs: Arc::new(RestrictedFileSystem::new([dir.path()]).unwrap()),
            todos: Arc::new(SessionTodos::new(vec![])),
            cancel: CancellationToken::new(),
            command_timeout: Duration::from_secs(5),
        };
        let call = ToolCall {
            id: "c1".into(),
            name: WRITE_FILE.into(),
            args: json!({"path": "a.txt", "content": "x"}),
        };
        let err = set.execute(&ctx, &call).await.unwrap_err();
        assert_eq!(err, ToolError::NotAllowed(WRITE_FILE.into()));
        assert!(!dir.path().join("a.txt").exists());
    }
}
