// Built-in Tools
// File, todo and command handlers exposed to agent sessions

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use convoy_types::{TodoStatus, ToolOutput, ToolSchema};

use crate::{
    Tool, ToolContext, ToolError, LIST_FILES, LIST_TODOS, READ_FILE, RUN_COMMAND,
    UPDATE_TODO_STATUS, WRITE_FILE,
};

const MAX_READ_CHARS: usize = 64_000;
const MAX_COMMAND_OUTPUT_CHARS: usize = 16_000;

fn required_str<'a>(tool: &str, args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::invalid_args(tool, format!("`{}` must be a string", key)))
}

fn truncate_chars(text: &str, max: usize) -> (String, bool) {
    match text.char_indices().nth(max) {
        Some((idx, _)) => (format!("{}\n...[truncated]", &text[..idx]), true),
        None => (text.to_string(), false),
    }
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: READ_FILE.to_string(),
            description: "Read a UTF-8 text file inside the session's allowed paths".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        let path = required_str(READ_FILE, &args, "path")?;
        let content = ctx.fs.read(path).await?;
        let (content, truncated) = truncate_chars(&content, MAX_READ_CHARS);
        Ok(ToolOutput::with_metadata(
            content,
            json!({"path": path, "truncated": truncated}),
        ))
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: WRITE_FILE.to_string(),
            description: "Create or overwrite a file inside the session's allowed paths"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        let path = required_str(WRITE_FILE, &args, "path")?;
        let content = required_str(WRITE_FILE, &args, "content")?;
        let written = ctx.fs.write(path, content).await?;
        Ok(ToolOutput::with_metadata(
            format!("wrote {} bytes to {}", content.len(), path),
            json!({"path": written.display().to_string(), "bytes": content.len()}),
        ))
    }
}

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: LIST_FILES.to_string(),
            description: "List files under a directory (defaults to the primary allowed path)"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}}
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        let path = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let base = ctx.fs.primary_root().to_path_buf();
        let files = ctx.fs.list(path)?;
        let lines = files
            .iter()
            .map(|file| {
                file.strip_prefix(&base)
                    .map(|rel| rel.display().to_string())
                    .unwrap_or_else(|_| file.display().to_string())
            })
            .collect::<Vec<_>>();
        Ok(ToolOutput::with_metadata(
            lines.join("\n"),
            json!({"count": lines.len()}),
        ))
    }
}

/// Runs a shell command in the primary allowed path. The command itself is
/// not path-confined, so sessions only get it when commands are granted
/// explicitly and never while sibling sessions share the workspace. It is
/// bounded by the session timeout and cancellation.
pub struct RunCommandTool;

#[async_trait]
impl Tool for RunCommandTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: RUN_COMMAND.to_string(),
            description: "Run a shell command in the session's working directory".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"command": {"type": "string"}},
                "required": ["command"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        let cmd = required_str(RUN_COMMAND, &args, "command")?;
        if cmd.trim().is_empty() {
            return Err(ToolError::invalid_args(RUN_COMMAND, "command is empty"));
        }
        // Fails fast once the session has released its sandbox.
        let cwd = ctx.fs.resolve(".")?;

        let mut command = Command::new("sh");
        command
            .args(["-c", cmd])
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|e| ToolError::Execution {
            message: format!("failed to spawn command: {}", e),
            retryable: false,
        })?;

        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
            result = tokio::time::timeout(ctx.command_timeout, child.wait_with_output()) => match result {
                Err(_) => return Err(ToolError::Timeout(ctx.command_timeout)),
                Ok(Err(e)) => return Err(ToolError::Execution {
                    message: format!("command failed: {}", e),
                    retryable: true,
                }),
                Ok(Ok(output)) => output,
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            combined.push_str("\n[stderr]\n");
            combined.push_str(&stderr);
        }
        let (combined, truncated) = truncate_chars(&combined, MAX_COMMAND_OUTPUT_CHARS);
        let exit_code = output.status.code();
        Ok(ToolOutput::with_metadata(
            format!(
                "exit code: {}\n{}",
                exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                combined
            ),
            json!({"exit_code": exit_code, "success": output.status.success(), "truncated": truncated}),
        ))
    }
}

pub struct UpdateTodoStatusTool;

#[async_trait]
impl Tool for UpdateTodoStatusTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: UPDATE_TODO_STATUS.to_string(),
            description: "Record progress on one of your todos (in_progress, done or failed)"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "status": {"type": "string", "enum": ["in_progress", "done", "failed"]},
                    "note": {"type": "string"}
                },
                "required": ["id", "status"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        let id = required_str(UPDATE_TODO_STATUS, &args, "id")?;
        let raw = required_str(UPDATE_TODO_STATUS, &args, "status")?;
        let status = serde_json::from_value::<TodoStatus>(Value::String(raw.to_string()))
            .map_err(|_| {
                ToolError::invalid_args(UPDATE_TODO_STATUS, format!("unknown status `{}`", raw))
            })?;
        ctx.todos.claim(id, status)?;
        Ok(ToolOutput::with_metadata(
            format!("recorded {} as {}", id, status),
            json!({"id": id, "status": status}),
        ))
    }
}

pub struct ListTodosTool;

#[async_trait]
impl Tool for ListTodosTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: LIST_TODOS.to_string(),
            description: "List the todos assigned to this session with their current status"
                .to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn execute(&self, ctx: &ToolContext, _args: Value) -> Result<ToolOutput, ToolError> {
        let todos = ctx.todos.list();
        let lines = todos
            .iter()
            .map(|t| format!("[{}] {} {}", t.status, t.id, t.text))
            .collect::<Vec<_>>();
        Ok(ToolOutput::with_metadata(
            lines.join("\n"),
            json!({"todos": todos}),
        ))
    }
}
