// Run Store
// Snapshot persistence for runs: run.json per run, append-only event log, archive on finish

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{OrchestratorError, Result};
use crate::types::{OrchestratorEvent, Run, RunStatus};

const RUN_FILE: &str = "run.json";
const EVENTS_FILE: &str = "events.jsonl";

/// Short listing entry for `convoy status`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub status: RunStatus,
    pub mode: String,
    pub task_description: String,
    pub archived: bool,
    pub spent: f64,
}

/// Persists run snapshots under `<workspace>/<state_dir>/runs/<run_id>/`.
/// Finished runs move to `<workspace>/<state_dir>/archive/<run_id>/`.
#[derive(Debug, Clone)]
pub struct RunStore {
    runs_dir: PathBuf,
    archive_dir: PathBuf,
}

impl RunStore {
    pub fn new(workspace: &Path, state_dir: &str) -> Result<Self> {
        let base = workspace.join(state_dir);
        let runs_dir = base.join("runs");
        let archive_dir = base.join("archive");
        fs::create_dir_all(&runs_dir)?;
        fs::create_dir_all(&archive_dir)?;
        Ok(Self {
            runs_dir,
            archive_dir,
        })
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    fn archived_dir(&self, run_id: &str) -> PathBuf {
        self.archive_dir.join(run_id)
    }

    pub fn save_run(&self, run: &Run) -> Result<()> {
        let dir = self.run_dir(&run.id);
        fs::create_dir_all(&dir)?;
        let content = serde_json::to_string_pretty(run)?;
        atomic_write(&dir.join(RUN_FILE), &content)
    }

    /// Loads an active run, falling back to the archive.
    pub fn load_run(&self, run_id: &str) -> Result<Run> {
        let path = [self.run_dir(run_id), self.archived_dir(run_id)]
            .into_iter()
            .map(|dir| dir.join(RUN_FILE))
            .find(|path| path.exists())
            .ok_or_else(|| OrchestratorError::NotFound(format!("run `{}`", run_id)))?;
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn run_exists(&self, run_id: &str) -> bool {
        self.run_dir(run_id).join(RUN_FILE).exists()
    }

    pub fn is_archived(&self, run_id: &str) -> bool {
        self.archived_dir(run_id).join(RUN_FILE).exists()
    }

    pub fn append_event(&self, run_id: &str, event: &OrchestratorEvent) -> Result<()> {
        let dir = self.run_dir(run_id);
        // Events may arrive before the first snapshot is written.
        fs::create_dir_all(&dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Reads the event log, skipping lines that no longer parse.
    pub fn load_events(&self, run_id: &str) -> Result<Vec<OrchestratorEvent>> {
        let path = [self.run_dir(run_id), self.archived_dir(run_id)]
            .into_iter()
            .map(|dir| dir.join(EVENTS_FILE))
            .find(|path| path.exists());
        let Some(path) = path else {
            return Ok(Vec::new());
        };
        let reader = BufReader::new(File::open(&path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if let Ok(event) = serde_json::from_str(&line) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Moves a terminal run out of the active directory.
    pub fn archive_run(&self, run_id: &str) -> Result<PathBuf> {
        let from = self.run_dir(run_id);
        if !from.exists() {
            return Err(OrchestratorError::NotFound(format!("run `{}`", run_id)));
        }
        let to = self.archived_dir(run_id);
        if to.exists() {
            fs::remove_dir_all(&to)?;
        }
        fs::rename(&from, &to)?;
        Ok(to)
    }

    /// Moves an archived run back so it can be resumed.
    pub fn restore_run(&self, run_id: &str) -> Result<()> {
        let from = self.archived_dir(run_id);
        if !from.exists() {
            return Ok(());
        }
        fs::rename(&from, self.run_dir(run_id))?;
        Ok(())
    }

    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut summaries = Vec::new();
        for (dir, archived) in [(&self.runs_dir, false), (&self.archive_dir, true)] {
            for entry in fs::read_dir(dir)? {
                let Ok(entry) = entry else { continue };
                let path = entry.path().join(RUN_FILE);
                let Ok(content) = fs::read_to_string(&path) else {
                    continue;
                };
                let Ok(run) = serde_json::from_str::<Run>(&content) else {
                    tracing::warn!(path = %path.display(), "skipping unreadable run snapshot");
                    continue;
                };
                summaries.push(RunSummary {
                    id: run.id,
                    status: run.status,
                    mode: run.mode.to_string(),
                    task_description: run.task_description,
                    archived,
                    spent: run.budget.spent,
                });
            }
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }
}

/// Write to a sibling temp file, then rename over the target.
pub(crate) fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
