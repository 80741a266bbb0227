// Todo Store
// Markdown checklist persistence: tolerant load, marker-only status rewrites, static partitioning

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use convoy_types::{Todo, TodoStatus, DEFAULT_CATEGORY};

use crate::error::{OrchestratorError, Result};
use crate::types::Partition;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedTodos {
    pub todos: Vec<Todo>,
    pub warnings: Vec<String>,
}

/// A parsed item plus the byte offset of its status marker in the source.
#[derive(Debug, Clone)]
struct Entry {
    todo: Todo,
    marker_offset: usize,
}

enum LineKind {
    Item {
        marker: char,
        marker_offset: usize,
        explicit_id: Option<String>,
        text: String,
    },
    Malformed(String),
    Heading(String),
    Other,
}

fn slugify(raw: &str) -> String {
    let mut out = String::new();
    for c in raw.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn classify(line: &str) -> LineKind {
    let body = line.trim_end_matches(['\n', '\r']);
    let indent = body.len() - body.trim_start().len();
    let rest = &body[indent..];

    if let Some(heading) = rest.strip_prefix("##") {
        let slug = slugify(heading.trim_start_matches('#'));
        return if slug.is_empty() {
            LineKind::Other
        } else {
            LineKind::Heading(slug)
        };
    }

    let mut chars = rest.char_indices();
    let is_checklist = matches!(chars.next(), Some((_, '-' | '*' | '+')))
        && matches!(chars.next(), Some((_, ' ')))
        && matches!(chars.next(), Some((_, '[')));
    if !is_checklist {
        return LineKind::Other;
    }

    let after_bracket = &rest[3..];
    let mut inner = after_bracket.chars();
    let (Some(marker), Some(']')) = (inner.next(), inner.next()) else {
        return LineKind::Malformed(format!("unterminated status marker in `{}`", body.trim()));
    };
    if TodoStatus::from_marker(marker).is_none() {
        return LineKind::Malformed(format!("unknown status marker `{}`", marker));
    }

    let text_part = &after_bracket[marker.len_utf8() + 1..];
    let text_part = text_part.trim();
    let (explicit_id, text) = match text_part.strip_prefix('{') {
        Some(tail) => match tail.split_once('}') {
            Some((id, text)) if is_valid_id(id.trim()) => {
                (Some(id.trim().to_string()), text.trim().to_string())
            }
            _ => return LineKind::Malformed(format!("invalid todo id in `{}`", text_part)),
        },
        None => (None, text_part.to_string()),
    };
    if text.is_empty() {
        return LineKind::Malformed("todo has no text".to_string());
    }

    LineKind::Item {
        marker,
        marker_offset: indent + 3,
        explicit_id,
        text,
    }
}

fn parse_entries(content: &str) -> (Vec<Entry>, Vec<String>) {
    let mut entries = Vec::new();
    let mut warnings = Vec::new();
    let mut category = DEFAULT_CATEGORY.to_string();
    let mut offset = 0;
    let mut seen_ids = HashSet::new();
    let mut pending: Vec<(usize, Option<String>, String, char, usize, String)> = Vec::new();

    for (line_no, line) in content.split_inclusive('\n').enumerate() {
        match classify(line) {
            LineKind::Heading(slug) => category = slug,
            LineKind::Malformed(reason) => {
                warnings.push(format!("line {}: {}", line_no + 1, reason));
            }
            LineKind::Item {
                marker,
                marker_offset,
                explicit_id,
                text,
            } => {
                if let Some(id) = &explicit_id {
                    if !seen_ids.insert(id.clone()) {
                        warnings.push(format!("line {}: duplicate todo id `{}`", line_no + 1, id));
                        offset += line.len();
                        continue;
                    }
                }
                pending.push((
                    line_no,
                    explicit_id,
                    text,
                    marker,
                    offset + marker_offset,
                    category.clone(),
                ));
            }
            LineKind::Other => {}
        }
        offset += line.len();
    }

    for (ordinal, (line_no, explicit_id, text, marker, marker_offset, category)) in
        pending.into_iter().enumerate()
    {
        let id = match explicit_id {
            Some(id) => id,
            None => {
                let generated = format!("todo-{}", ordinal + 1);
                if !seen_ids.insert(generated.clone()) {
                    warnings.push(format!(
                        "line {}: implicit id `{}` collides with an explicit id",
                        line_no + 1,
                        generated
                    ));
                    continue;
                }
                generated
            }
        };
        let Some(status) = TodoStatus::from_marker(marker) else {
            continue;
        };
        let mut todo = Todo::new(id, text, category);
        todo.status = status;
        entries.push(Entry {
            todo,
            marker_offset,
        });
    }

    (entries, warnings)
}

/// Parses checklist content. Never fails: malformed items become warnings.
pub fn parse_todos(content: &str) -> LoadedTodos {
    let (entries, warnings) = parse_entries(content);
    LoadedTodos {
        todos: entries.into_iter().map(|e| e.todo).collect(),
        warnings,
    }
}

/// Groups todos by category in first-seen order; one partition per category.
pub fn partition_by_category(todos: &[Todo]) -> Vec<Partition> {
    let mut partitions: Vec<Partition> = Vec::new();
    for todo in todos {
        match partitions.iter_mut().find(|p| p.category == todo.category) {
            Some(partition) => partition.todo_ids.push(todo.id.clone()),
            None => partitions.push(Partition::new(
                todo.category.clone(),
                todo.category.clone(),
                vec![todo.id.clone()],
            )),
        }
    }
    partitions
}

// ============================================================================
// Todo Store
// ============================================================================

/// The persisted todo list. Status changes rewrite a single marker byte in
/// place via temp-file-then-rename; everything else in the file is preserved.
#[derive(Debug)]
pub struct TodoStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TodoStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<LoadedTodos> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            OrchestratorError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to read todo list {}: {}", self.path.display(), e),
            ))
        })?;
        Ok(parse_todos(&content))
    }

    pub async fn mark_in_progress(&self, id: &str) -> Result<Todo> {
        self.set_status(id, TodoStatus::InProgress).await
    }

    pub async fn mark_done(&self, id: &str) -> Result<Todo> {
        self.set_status(id, TodoStatus::Done).await
    }

    pub async fn mark_failed(&self, id: &str) -> Result<Todo> {
        self.set_status(id, TodoStatus::Failed).await
    }

    /// Re-queues an interrupted todo (`in_progress -> open`).
    pub async fn mark_reopened(&self, id: &str) -> Result<Todo> {
        self.set_status(id, TodoStatus::Open).await
    }

    async fn set_status(&self, id: &str, next: TodoStatus) -> Result<Todo> {
        let _guard = self.write_lock.lock().await;
        let content = tokio::fs::read_to_string(&self.path).await?;
        let (entries, _) = parse_entries(&content);
        let Some(entry) = entries.into_iter().find(|e| e.todo.id == id) else {
            return Err(OrchestratorError::NotFound(format!("todo `{}`", id)));
        };

        let mut todo = entry.todo;
        if todo.status == next {
            return Ok(todo);
        }
        if !todo.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition(format!(
                "todo `{}` cannot move from {} to {}",
                id, todo.status, next
            )));
        }

        let mut bytes = content.into_bytes();
        bytes[entry.marker_offset] = next.marker() as u8;
        write_atomic(&self.path, &bytes).await?;

        todo.status = next;
        tracing::debug!(todo_id = %id, status = %next, "todo status persisted");
        Ok(todo)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| OrchestratorError::Validation(format!("bad todo path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    const SAMPLE: &str = "# Sprint\n\nSome intro text.\n- [ ] loose item\n\n## Backend API\n- [ ] {api-1} Add endpoint  \r\n- [x] Write handler\n  * [~] nested work\n- [?] broken marker\n- [ ]\n## ui\n+ [X] {ui-1} Button\n- [!] {api-1} duplicate id\n";

    #[test]
    fn parses_categories_ids_and_statuses() {
        let loaded = parse_todos(SAMPLE);
        let summary = loaded
            .todos
            .iter()
            .map(|t| (t.id.as_str(), t.category.as_str(), t.status))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                ("todo-1", "general", TodoStatus::Open),
                ("api-1", "backend-api", TodoStatus::Open),
                ("todo-3", "backend-api", TodoStatus::Done),
                ("todo-4", "backend-api", TodoStatus::InProgress),
                ("ui-1", "ui", TodoStatus::Done),
            ]
        );
        assert_eq!(loaded.todos[1].text, "Add endpoint");
        assert_eq!(loaded.warnings.len(), 3, "{:?}", loaded.warnings);
    }

    #[test]
    fn empty_input_yields_no_todos() {
        assert_eq!(parse_todos(""), LoadedTodos::default());
        assert!(parse_todos("just prose\n").todos.is_empty());
    }

    #[test]
    fn partitions_follow_first_seen_category_order() {
        let loaded = parse_todos("## b\n- [ ] one\n## a\n- [ ] two\n## b\n- [ ] three\n");
        let partitions = partition_by_category(&loaded.todos);
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].id, "b");
        assert_eq!(partitions[0].todo_ids, vec!["todo-1", "todo-3"]);
        assert_eq!(partitions[1].todo_ids, vec!["todo-2"]);
    }

    #[tokio::test]
    async fn status_changes_only_touch_the_marker() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("TODO.md");
        std::fs::write(&path, SAMPLE).unwrap();
        let store = TodoStore::new(&path);

        store.mark_in_progress("api-1").await.unwrap();
        store.mark_done("api-1").await.unwrap();

        let after = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            after,
            SAMPLE.replace("- [ ] {api-1} Add endpoint", "- [x] {api-1} Add endpoint")
        );
        assert!(!dir.path().join(".TODO.md.tmp").exists());
    }

    #[tokio::test]
    async fn unknown_id_and_illegal_transition_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("TODO.md");
        std::fs::write(&path, SAMPLE).unwrap();
        let store = TodoStore::new(&path);

        assert!(matches!(
            store.mark_done("nope").await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            store.mark_done("todo-1").await,
            Err(OrchestratorError::InvalidTransition(_))
        ));
        assert!(matches!(
            store.mark_reopened("ui-1").await,
            Err(OrchestratorError::InvalidTransition(_))
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SAMPLE);
    }

    #[tokio::test]
    async fn requeue_moves_in_progress_back_to_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("TODO.md");
        std::fs::write(&path, SAMPLE).unwrap();
        let store = TodoStore::new(&path);
        let todo = store.mark_reopened("todo-4").await.unwrap();
        assert_eq!(todo.status, TodoStatus::Open);
        assert!(std::fs::read_to_string(&path)
            .unwrap()
            .contains("  * [ ] nested work"));
    }

    #[tokio::test]
    async fn concurrent_updates_do_not_lose_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("TODO.md");
        let content = (1..=12).map(|i| format!("- [~] item {}\n", i)).collect::<String>();
        std::fs::write(&path, content).unwrap();
        let store = std::sync::Arc::new(TodoStore::new(&path));

        let mut handles = Vec::new();
        for i in 1..=12 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.mark_done(&format!("todo-{}", i)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let loaded = store.load().await.unwrap();
        assert!(loaded.todos.iter().all(|t| t.status == TodoStatus::Done));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let store = TodoStore::new(dir.path().join("absent.md"));
        assert!(store.load().await.is_err());
    }

    fn line() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z ]{0,12}".prop_map(|s| s),
            "[a-z]{1,8}".prop_map(|s| format!("## {}", s)),
            ("[ x~!]", "[a-z ]{1,10}").prop_map(|(m, t)| format!("- [{}] {}", m, t)),
            ("[a-z]{1,6}", "[a-z]{1,10}").prop_map(|(id, t)| format!("- [ ] {{{}}} {}", id, t)),
            Just("- [?] weird".to_string()),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn marking_done_flips_exactly_one_line(
            lines in prop::collection::vec(line(), 1..20),
            crlf in any::<bool>(),
            pick in any::<prop::sample::Index>(),
        ) {
            let sep = if crlf { "\r\n" } else { "\n" };
            let content = lines.join(sep) + sep;
            let before = parse_todos(&content);
            let open = before
                .todos
                .iter()
                .filter(|t| t.status == TodoStatus::Open)
                .collect::<Vec<_>>();
            prop_assume!(!open.is_empty());
            let target = open[pick.index(open.len())].id.clone();

            let dir = tempdir().unwrap();
            let path = dir.path().join("TODO.md");
            std::fs::write(&path, &content).unwrap();
            let store = TodoStore::new(&path);
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                store.mark_in_progress(&target).await.unwrap();
                store.mark_done(&target).await.unwrap();
            });

            let after_content = std::fs::read_to_string(&path).unwrap();
            let after = parse_todos(&after_content);
            prop_assert_eq!(after.todos.len(), before.todos.len());
            for (b, a) in before.todos.iter().zip(after.todos.iter()) {
                prop_assert_eq!(&b.id, &a.id);
                if b.id == target {
                    prop_assert_eq!(a.status, TodoStatus::Done);
                } else {
                    prop_assert_eq!(a.status, b.status);
                }
            }
            let changed_lines = content
                .split_inclusive('\n')
                .zip(after_content.split_inclusive('\n'))
                .filter(|(x, y)| x != y)
                .count();
            prop_assert_eq!(changed_lines, 1);
            prop_assert_eq!(content.len(), after_content.len());
        }
    }
}
