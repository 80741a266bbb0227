use serde::{Deserialize, Serialize};

pub const DEFAULT_CATEGORY: &str = "general";

/// Lifecycle of a single work item.
///
/// Legal edges are `open -> in_progress -> {done, failed}` plus the explicit
/// re-queue `in_progress -> open`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Open,
    InProgress,
    Done,
    Failed,
}

impl TodoStatus {
    pub fn marker(self) -> char {
        match self {
            TodoStatus::Open => ' ',
            TodoStatus::InProgress => '~',
            TodoStatus::Done => 'x',
            TodoStatus::Failed => '!',
        }
    }

    pub fn from_marker(marker: char) -> Option<Self> {
        match marker {
            ' ' => Some(TodoStatus::Open),
            '~' => Some(TodoStatus::InProgress),
            'x' | 'X' => Some(TodoStatus::Done),
            '!' => Some(TodoStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TodoStatus::Done | TodoStatus::Failed)
    }

    pub fn can_transition_to(self, next: TodoStatus) -> bool {
        matches!(
            (self, next),
            (TodoStatus::Open, TodoStatus::InProgress)
                | (TodoStatus::InProgress, TodoStatus::Done)
                | (TodoStatus::InProgress, TodoStatus::Failed)
                | (TodoStatus::InProgress, TodoStatus::Open)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TodoStatus::Open => "open",
            TodoStatus::InProgress => "in_progress",
            TodoStatus::Done => "done",
            TodoStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Todo {
    pub id: String,
    pub text: String,
    pub status: TodoStatus,
    pub category: String,
    #[serde(default)]
    pub owning_agent_id: Option<String>,
}

impl Todo {
    pub fn new(id: impl Into<String>, text: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            status: TodoStatus::Open,
            category: category.into(),
            owning_agent_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_round_trip_through_status() {
        for status in [
            TodoStatus::Open,
            TodoStatus::InProgress,
            TodoStatus::Done,
            TodoStatus::Failed,
        ] {
            assert_eq!(TodoStatus::from_marker(status.marker()), Some(status));
        }
        assert_eq!(TodoStatus::from_marker('X'), Some(TodoStatus::Done));
        assert_eq!(TodoStatus::from_marker('?'), None);
    }

    #[test]
    fn only_forward_edges_and_requeue_are_legal() {
        use TodoStatus::*;
        assert!(Open.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Done));
        assert!(InProgress.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Open));
        assert!(!Open.can_transition_to(Done));
        assert!(!Done.can_transition_to(Open));
        assert!(!Failed.can_transition_to(InProgress));
    }
}
