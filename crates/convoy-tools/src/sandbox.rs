// Restricted Filesystem
// Path-confined file access for agent sessions: root containment, protected paths, touched-file tracking

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use ignore::WalkBuilder;

use crate::ToolError;

const MAX_LIST_ENTRIES: usize = 500;

/// File access confined to a fixed set of roots.
///
/// Roots are canonicalised once at construction. Every request path is
/// resolved against the real filesystem (symlinks followed, `..` applied to
/// the resolved prefix) before the containment check, so neither traversal
/// segments nor links can escape. Protected paths inside the roots are
/// readable but never writable.
#[derive(Debug)]
pub struct RestrictedFileSystem {
    roots: Vec<PathBuf>,
    protected: Vec<PathBuf>,
    touched: Mutex<BTreeSet<PathBuf>>,
    closed: AtomicBool,
}

impl RestrictedFileSystem {
    pub fn new<I, P>(roots: I) -> Result<Self, ToolError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut canonical = Vec::new();
        for root in roots {
            let root = root.as_ref();
            let resolved = std::fs::canonicalize(root).map_err(|e| {
                ToolError::Config(format!("allowed path {} is unusable: {}", root.display(), e))
            })?;
            if !resolved.is_dir() {
                return Err(ToolError::Config(format!(
                    "allowed path {} is not a directory",
                    root.display()
                )));
            }
            if !canonical.contains(&resolved) {
                canonical.push(resolved);
            }
        }
        if canonical.is_empty() {
            return Err(ToolError::Config("at least one allowed path is required".into()));
        }
        Ok(Self {
            roots: canonical,
            protected: Vec::new(),
            touched: Mutex::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_protected<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for path in paths {
            if let Ok(resolved) = resolve_path(path.as_ref()) {
                self.protected.push(resolved);
            }
        }
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn primary_root(&self) -> &Path {
        &self.roots[0]
    }

    /// Canonical form of `path` if it lies inside an allowed root.
    /// Relative paths are taken relative to the primary root.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf, ToolError> {
        self.ensure_open()?;
        let requested = path.as_ref();
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.primary_root().join(requested)
        };
        let resolved = resolve_path(&joined)?;
        if self.roots.iter().any(|root| resolved.starts_with(root)) {
            Ok(resolved)
        } else {
            Err(ToolError::Permission(format!(
                "{} is outside the allowed paths",
                requested.display()
            )))
        }
    }

    pub fn is_protected(&self, resolved: &Path) -> bool {
        self.protected.iter().any(|p| resolved.starts_with(p))
    }

    pub async fn read(&self, path: impl AsRef<Path>) -> Result<String, ToolError> {
        let resolved = self.resolve(path.as_ref())?;
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| io_error(&resolved, e))
    }

    pub async fn write(&self, path: impl AsRef<Path>, content: &str) -> Result<PathBuf, ToolError> {
        let resolved = self.resolve(path.as_ref())?;
        if self.is_protected(&resolved) {
            return Err(ToolError::Permission(format!(
                "{} is read-only for agents",
                path.as_ref().display()
            )));
        }
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| io_error(&resolved, e))?;
        if let Ok(mut touched) = self.touched.lock() {
            touched.insert(resolved.clone());
        }
        Ok(resolved)
    }

    /// Files below `path`, honouring ignore files and skipping protected paths.
    pub fn list(&self, path: impl AsRef<Path>) -> Result<Vec<PathBuf>, ToolError> {
        let resolved = self.resolve(path.as_ref())?;
        if !resolved.is_dir() {
            return Err(ToolError::NotFound(format!(
                "{} is not a directory",
                path.as_ref().display()
            )));
        }
        let protected = self.protected.clone();
        let mut out = Vec::new();
        let walker = WalkBuilder::new(&resolved)
            .follow_links(false)
            .filter_entry(move |entry| !protected.iter().any(|p| entry.path().starts_with(p)))
            .build();
        for entry in walker.flatten() {
            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            out.push(entry.into_path());
            if out.len() >= MAX_LIST_ENTRIES {
                break;
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn touched_paths(&self) -> Vec<PathBuf> {
        self.touched
            .lock()
            .map(|touched| touched.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Releases the handle; every later operation fails.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), ToolError> {
        if self.is_closed() {
            return Err(ToolError::Permission("filesystem handle is closed".into()));
        }
        Ok(())
    }
}

/// Resolves an absolute path component by component: existing prefixes go
/// through the OS (following links), missing tails are applied lexically.
fn resolve_path(path: &Path) -> Result<PathBuf, ToolError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => {
                out.push(name);
                let Ok(meta) = std::fs::symlink_metadata(&out) else {
                    continue;
                };
                if meta.file_type().is_symlink() {
                    out = std::fs::canonicalize(&out).map_err(|_| {
                        ToolError::Permission(format!(
                            "{} is a link that cannot be resolved",
                            path.display()
                        ))
                    })?;
                }
            }
        }
    }
    if out.as_os_str().is_empty() || !out.is_absolute() {
        return Err(ToolError::Permission(format!(
            "{} does not resolve to an absolute path",
            path.display()
        )));
    }
    Ok(out)
}

fn io_error(path: &Path, err: std::io::Error) -> ToolError {
    match err.kind() {
        ErrorKind::NotFound => ToolError::NotFound(path.display().to_string()),
        ErrorKind::PermissionDenied => ToolError::Permission(path.display().to_string()),
        _ => ToolError::Execution {
            message: format!("{}: {}", path.display(), err),
            retryable: true,
        },
    }
}
