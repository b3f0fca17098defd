//! Durable `PipelineState` persistence (§4.4).
//!
//! Single-writer model: `StateStore` owns the in-memory state and every
//! mutation goes through `&mut self`; callers outside the coordinator's
//! control thread only ever see `load`'s cloned snapshot.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};

use crate::errors::FatalStateError;
use crate::state::types::{FileState, PipelineState, TaskState, TaskStatus};

const MAX_BACKUPS: usize = 5;

/// Durable state for one project directory.
///
/// Holds the current `PipelineState` in memory; `save` is the only path
/// that touches disk, using write-tmp/fsync/rename so a crash mid-write
/// never corrupts `state.json` (§4.4).
pub struct StateStore {
    state_dir: PathBuf,
    state: PipelineState,
    /// Serialized form of the state as of the last successful save, used
    /// to make `save` a no-op when nothing changed (R3).
    last_saved_json: Option<String>,
}

impl StateStore {
    fn state_path(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    /// Load `state.json` from `state_dir`, falling back to the newest
    /// backup on parse failure, or start fresh if neither exists.
    pub fn load(state_dir: impl Into<PathBuf>) -> Result<Self, FatalStateError> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir).map_err(|source| FatalStateError::WriteFailed {
            path: state_dir.clone(),
            source,
        })?;

        let state_path = state_dir.join("state.json");
        if !state_path.exists() {
            info!(path = %state_path.display(), "no existing state, starting fresh");
            return Ok(Self {
                state_dir,
                state: PipelineState::default(),
                last_saved_json: None,
            });
        }

        let raw = fs::read_to_string(&state_path).map_err(|source| FatalStateError::ReadFailed {
            path: state_path.clone(),
            source,
        })?;

        match serde_json::from_str::<PipelineState>(&raw) {
            Ok(state) => Ok(Self {
                state_dir,
                state,
                last_saved_json: Some(raw),
            }),
            Err(primary_err) => {
                warn!(
                    path = %state_path.display(),
                    error = %primary_err,
                    "state.json failed to parse, attempting most recent backup"
                );
                Self::load_from_backup(&state_dir, &state_path, primary_err)
            }
        }
    }

    fn load_from_backup(
        state_dir: &Path,
        state_path: &Path,
        primary_err: serde_json::Error,
    ) -> Result<Self, FatalStateError> {
        let mut backups = Self::list_backups(state_dir).map_err(|source| FatalStateError::ReadFailed {
            path: state_dir.to_path_buf(),
            source,
        })?;
        backups.sort_by(|a, b| b.1.cmp(&a.1));

        for (path, _ts) in backups {
            if let Ok(raw) = fs::read_to_string(&path) {
                if let Ok(state) = serde_json::from_str::<PipelineState>(&raw) {
                    warn!(backup = %path.display(), "recovered state from backup");
                    return Ok(Self {
                        state_dir: state_dir.to_path_buf(),
                        state,
                        last_saved_json: Some(raw),
                    });
                }
            }
        }

        Err(FatalStateError::Corrupt {
            path: state_path.to_path_buf(),
            source: primary_err,
        })
    }

    fn list_backups(state_dir: &Path) -> std::io::Result<Vec<(PathBuf, u64)>> {
        let mut backups = Vec::new();
        for entry in fs::read_dir(state_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(ts) = name.strip_prefix("state.json.bak.") {
                if let Ok(ts) = ts.parse::<u64>() {
                    backups.push((entry.path(), ts));
                }
            }
        }
        Ok(backups)
    }

    /// Persist the current state. A no-op if nothing changed since the
    /// last successful save (R3: no new backup is created).
    pub fn save(&mut self) -> Result<(), FatalStateError> {
        let json = serde_json::to_string_pretty(&self.state).map_err(|source| FatalStateError::WriteFailed {
            path: self.state_path(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, source),
        })?;

        if self.last_saved_json.as_deref() == Some(json.as_str()) {
            return Ok(());
        }

        let state_path = self.state_path();
        if state_path.exists() {
            let ts = Utc::now().timestamp_millis();
            let backup_path = self.state_dir.join(format!("state.json.bak.{ts}"));
            fs::copy(&state_path, &backup_path).map_err(|source| FatalStateError::WriteFailed {
                path: backup_path,
                source,
            })?;
            self.rotate_backups()?;
        }

        let tmp_path = self.state_dir.join("state.json.tmp");
        {
            let mut file = fs::File::create(&tmp_path).map_err(|source| FatalStateError::WriteFailed {
                path: tmp_path.clone(),
                source,
            })?;
            file.write_all(json.as_bytes()).map_err(|source| FatalStateError::WriteFailed {
                path: tmp_path.clone(),
                source,
            })?;
            file.sync_all().map_err(|source| FatalStateError::WriteFailed {
                path: tmp_path.clone(),
                source,
            })?;
        }
        fs::rename(&tmp_path, &state_path).map_err(|source| FatalStateError::WriteFailed {
            path: state_path,
            source,
        })?;

        self.last_saved_json = Some(json);
        Ok(())
    }

    fn rotate_backups(&self) -> Result<(), FatalStateError> {
        let mut backups = Self::list_backups(&self.state_dir).map_err(|source| FatalStateError::WriteFailed {
            path: self.state_dir.clone(),
            source,
        })?;
        backups.sort_by(|a, b| b.1.cmp(&a.1));
        for (path, _ts) in backups.into_iter().skip(MAX_BACKUPS) {
            let _ = fs::remove_file(path);
        }
        Ok(())
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Mutable access for the coordinator/phase substrate, which mutates
    /// tasks and files directly via the result-handler pipeline rather
    /// than through the narrower `put_task`/`file_modified` helpers.
    pub fn state_mut(&mut self) -> &mut PipelineState {
        &mut self.state
    }

    /// A cloned, consistent snapshot for callers that need to read
    /// without holding a reference across a suspension point (§5).
    pub fn snapshot(&self) -> PipelineState {
        self.state.clone()
    }

    pub fn get_task(&self, id: &str) -> Option<&TaskState> {
        self.state.tasks.get(id)
    }

    pub fn put_task(&mut self, task: TaskState) {
        self.state.tasks.insert(task.id.clone(), task);
    }

    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<&TaskState> {
        self.state.tasks_by_status(status)
    }

    /// Mark a file touched by `by_phase`, updating its digest and status.
    pub fn file_modified(&mut self, path: &str, by_phase: &str, hash: String) {
        let entry = self
            .state
            .files
            .entry(path.to_string())
            .or_insert_with(|| FileState::new(path));
        let changed = entry.hash.as_deref() != Some(hash.as_str());
        entry.hash = Some(hash);
        entry.last_modified_by_phase = Some(by_phase.to_string());
        if changed {
            entry.status = crate::state::types::FileStatus::Modified;
        }
    }

    pub fn increment_no_update_count(&mut self, phase: &str) {
        self.state.phase_mut(phase).no_update_count += 1;
    }

    pub fn reset_no_update_count(&mut self, phase: &str) {
        self.state.phase_mut(phase).no_update_count = 0;
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}
