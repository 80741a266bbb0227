use std::collections::BTreeMap;
use std::sync::Mutex;

use convoy_types::{Todo, TodoStatus};

use crate::ToolError;

/// A session's view of its own partition.
///
/// Agents record progress claims here; the durable todo file is only changed
/// by the orchestrator once the audit has passed.
#[derive(Debug)]
pub struct SessionTodos {
    items: Vec<Todo>,
    claims: Mutex<BTreeMap<String, TodoStatus>>,
}

impl SessionTodos {
    pub fn new(items: Vec<Todo>) -> Self {
        Self {
            items,
            claims: Mutex::new(BTreeMap::new()),
        }
    }

    /// Partition todos with any recorded claim applied.
    pub fn list(&self) -> Vec<Todo> {
        let claims = self.claims();
        self.items
            .iter()
            .map(|todo| {
                let mut todo = todo.clone();
                if let Some(status) = claims.get(&todo.id) {
                    todo.status = *status;
                }
                todo
            })
            .collect()
    }

    pub fn claim(&self, id: &str, status: TodoStatus) -> Result<(), ToolError> {
        if !self.items.iter().any(|t| t.id == id) {
            return Err(ToolError::Permission(format!(
                "todo `{}` is not part of this session's partition",
                id
            )));
        }
        if status == TodoStatus::Open {
            return Err(ToolError::InvalidArgs {
                tool: "update_todo_status".into(),
                reason: "status must be in_progress, done or failed".into(),
            });
        }
        if let Ok(mut claims) = self.claims.lock() {
            claims.insert(id.to_string(), status);
        }
        Ok(())
    }

    pub fn claims(&self) -> BTreeMap<String, TodoStatus> {
        self.claims
            .lock()
            .map(|claims| claims.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> SessionTodos {
        SessionTodos::new(vec![
            Todo::new("api-1", "add endpoint", "backend"),
            Todo::new("api-2", "add tests", "backend"),
        ])
    }

    #[test]
    fn claims_overlay_listing() {
        let todos = view();
        todos.claim("api-2", TodoStatus::Done).unwrap();
        let listed = todos.list();
        assert_eq!(listed[0].status, TodoStatus::Open);
        assert_eq!(listed[1].status, TodoStatus::Done);
    }

    #[test]
    fn foreign_todo_is_a_permission_error() {
        let todos = view();
        let err = todos.claim("ui-1", TodoStatus::Done).unwrap_err();
        assert!(matches!(err, ToolError::Permission(_)));
        assert!(todos.claims().is_empty());
    }

    #[test]
    fn reopening_is_not_an_agent_claim() {
        let todos = view();
        assert!(matches!(
            todos.claim("api-1", TodoStatus::Open),
            Err(ToolError::InvalidArgs { .. })
        ));
    }
}
