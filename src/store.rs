//! Workspace store (C1)
//!
//! Per-run durable state on the local filesystem. Layout under the project
//! root `P`:
//!
//! ```text
//! P/.claude-agent/<spec_slug>-<spec_hash>/
//!   workspace_info         WorkspaceInfo
//!   milestone              Milestone
//!   checkpoint_log         CheckpointLog
//!   quality_report         QualityReport for the current session
//!   app_spec               verbatim copy of the input spec
//!   host/                  file-only host backend state
//!   logs/<agent_id>-<ts>.log
//! ```
//!
//! All writes go through [`crate::atomic_write`]; required fields are checked
//! on read and never silently defaulted.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;

use crate::atomic_write::{write_bytes_atomic, write_json_atomic};
use crate::error::{HarnessError, StoreError};
use crate::paths;
use crate::spec_id;
use crate::types::{CheckpointLog, Milestone, ModeFlags, QualityReport, SessionFiles, WorkspaceInfo};

pub const WORKSPACE_INFO_FILE: &str = "workspace_info";
pub const MILESTONE_FILE: &str = "milestone";
pub const CHECKPOINT_LOG_FILE: &str = "checkpoint_log";
pub const QUALITY_REPORT_FILE: &str = "quality_report";
pub const APP_SPEC_FILE: &str = "app_spec";
pub const LOGS_DIR: &str = "logs";
pub const HOST_DIR: &str = "host";

/// Handle to one run's workspace directory.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    project_dir: Utf8PathBuf,
    root: Utf8PathBuf,
}

impl WorkspaceStore {
    /// Open a workspace handle without touching the filesystem.
    #[must_use]
    pub fn open(project_dir: &Utf8Path, spec_slug: &str, spec_hash: &str) -> Self {
        Self {
            project_dir: project_dir.to_owned(),
            root: paths::workspace_dir(project_dir, spec_slug, spec_hash),
        }
    }

    /// Create the workspace for a spec file, copying the spec verbatim and
    /// writing `workspace_info`.
    ///
    /// Idempotent per `(slug, hash)`: if the workspace already exists, the
    /// persisted info is returned unchanged except that `auto_accept` is
    /// refreshed from the caller (it is the one client-toggleable field).
    /// A corrupt existing `workspace_info` is an error, never repaired.
    pub fn bootstrap(
        project_dir: &Utf8Path,
        spec_file: &Utf8Path,
        target_branch: &str,
        auto_accept: bool,
        mode_flags: ModeFlags,
    ) -> Result<(Self, WorkspaceInfo), HarnessError> {
        let spec_slug = spec_id::slug_from_filename(spec_file);
        spec_id::validate_slug(&spec_slug)?;
        let spec_hash = spec_id::hash_from_content(spec_file)?;

        let store = Self::open(project_dir, &spec_slug, &spec_hash);
        paths::ensure_dir_all(store.root.as_std_path())
            .map_err(|e| StoreError::io("create directory", store.root.as_str(), e))?;

        let spec_bytes =
            fs::read(spec_file).map_err(|e| StoreError::io("read", spec_file.as_str(), e))?;
        write_bytes_atomic(&store.root.join(APP_SPEC_FILE), &spec_bytes)?;

        let info = match store.workspace_info() {
            Ok(mut existing) => {
                if existing.auto_accept != auto_accept {
                    existing.auto_accept = auto_accept;
                    store.write_workspace_info(&existing)?;
                }
                existing
            }
            Err(StoreError::NotFound { .. }) => {
                let info = WorkspaceInfo {
                    spec_slug: spec_slug.clone(),
                    spec_hash: spec_hash.clone(),
                    feature_branch: format!("feature/{spec_slug}-{spec_hash}"),
                    target_branch: target_branch.to_string(),
                    auto_accept,
                    mode_flags,
                };
                store.write_workspace_info(&info)?;
                info
            }
            Err(e) => return Err(e.into()),
        };

        Ok((store, info))
    }

    #[must_use]
    pub fn project_dir(&self) -> &Utf8Path {
        &self.project_dir
    }

    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.root.join(WORKSPACE_INFO_FILE).exists()
    }

    fn file_path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }

    /// Read a raw workspace file.
    pub fn read_bytes(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.file_path(name);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound {
                    path: path.to_string(),
                }
            } else {
                StoreError::io("read", path.as_str(), e)
            }
        })
    }

    /// Atomically replace a raw workspace file.
    pub fn write_bytes(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        write_bytes_atomic(&self.file_path(name), bytes)
    }

    /// Read and deserialize a JSON workspace file.
    pub fn read_json<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, StoreError> {
        let path = self.file_path(name);
        let bytes = self.read_bytes(name)?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Schema {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    /// Serialize and atomically replace a JSON workspace file.
    pub fn write_json<T: serde::Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        write_json_atomic(&self.file_path(name), value)
    }

    /// Load `workspace_info`, enforcing the required non-empty fields.
    pub fn workspace_info(&self) -> Result<WorkspaceInfo, StoreError> {
        let info: WorkspaceInfo = self.read_json(WORKSPACE_INFO_FILE)?;
        let required = [
            ("spec_slug", &info.spec_slug),
            ("spec_hash", &info.spec_hash),
            ("feature_branch", &info.feature_branch),
            ("target_branch", &info.target_branch),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(StoreError::Schema {
                    path: self.file_path(WORKSPACE_INFO_FILE).to_string(),
                    reason: format!("required field '{field}' is empty"),
                });
            }
        }
        Ok(info)
    }

    pub fn write_workspace_info(&self, info: &WorkspaceInfo) -> Result<(), StoreError> {
        self.write_json(WORKSPACE_INFO_FILE, info)
    }

    /// Flip the one client-toggleable field between sessions.
    pub fn set_auto_accept(&self, auto_accept: bool) -> Result<(), StoreError> {
        let mut info = self.workspace_info()?;
        info.auto_accept = auto_accept;
        self.write_workspace_info(&info)
    }

    #[must_use]
    pub fn milestone_exists(&self) -> bool {
        self.file_path(MILESTONE_FILE).exists()
    }

    /// Load the milestone, enforcing the identity fields.
    pub fn milestone(&self) -> Result<Milestone, StoreError> {
        let milestone: Milestone = self.read_json(MILESTONE_FILE)?;
        let path = self.file_path(MILESTONE_FILE).to_string();
        if milestone.repository.trim().is_empty() {
            return Err(StoreError::Schema {
                path,
                reason: "required field 'repository' is empty".into(),
            });
        }
        if milestone.milestone_title.trim().is_empty() {
            return Err(StoreError::Schema {
                path,
                reason: "required field 'milestone_title' is empty".into(),
            });
        }
        Ok(milestone)
    }

    pub fn write_milestone(&self, milestone: &Milestone) -> Result<(), StoreError> {
        self.write_json(MILESTONE_FILE, milestone)
    }

    /// Load the checkpoint log; a missing file is an empty log.
    pub fn checkpoint_log(&self) -> Result<CheckpointLog, StoreError> {
        match self.read_json(CHECKPOINT_LOG_FILE) {
            Ok(log) => Ok(log),
            Err(StoreError::NotFound { .. }) => Ok(CheckpointLog::default()),
            Err(e) => Err(e),
        }
    }

    pub fn write_checkpoint_log(&self, log: &CheckpointLog) -> Result<(), StoreError> {
        self.write_json(CHECKPOINT_LOG_FILE, log)
    }

    /// The quality report for the current session, if one was recorded.
    pub fn quality_report(&self) -> Result<Option<QualityReport>, StoreError> {
        match self.read_json(QUALITY_REPORT_FILE) {
            Ok(report) => Ok(Some(report)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn write_quality_report(&self, report: &QualityReport) -> Result<(), StoreError> {
        self.write_json(QUALITY_REPORT_FILE, report)
    }

    /// Reset per-session state: empty the tracked-file list and drop the
    /// previous session's quality report. Called at the top of every session
    /// so no state leaks across subprocess boundaries.
    pub fn begin_session(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        if self.milestone_exists() {
            let mut milestone = self.milestone()?;
            milestone.session_files = SessionFiles::fresh(now);
            self.write_milestone(&milestone)?;
        }
        let quality = self.file_path(QUALITY_REPORT_FILE);
        if quality.exists() {
            fs::remove_file(&quality).map_err(|e| StoreError::io("remove", quality.as_str(), e))?;
        }
        Ok(())
    }

    /// Record files the current session has modified. Paths are stored
    /// project-relative and deduplicated, preserving first-seen order.
    pub fn track_files<I, S>(&self, paths: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut milestone = self.milestone()?;
        let now = Utc::now();
        for path in paths {
            let path = path.into();
            if !milestone.session_files.tracked.contains(&path) {
                milestone.session_files.tracked.push(path);
            }
        }
        milestone.session_files.last_updated = now;
        self.write_milestone(&milestone)
    }

    /// Path for a new session log: `logs/<agent_id>-<ts>.log`.
    pub fn new_session_log(&self, agent_id: u64) -> Result<Utf8PathBuf, StoreError> {
        let dir = self.root.join(LOGS_DIR);
        paths::ensure_dir_all(dir.as_std_path()).map_err(|e| StoreError::io("create directory", dir.as_str(), e))?;
        let ts = Utc::now().format("%Y%m%d-%H%M%S%.3f");
        Ok(dir.join(format!("{agent_id}-{ts}.log")))
    }

    /// Byte-append one line to a session log, with implicit timestamping.
    pub fn append_log(log_path: &Utf8Path, line: &str) -> Result<(), StoreError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| StoreError::io("open for append", log_path.as_str(), e))?;
        let stamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        writeln!(file, "[{stamp}] {line}").map_err(|e| StoreError::io("append", log_path.as_str(), e))?;
        Ok(())
    }

    /// Last `max_bytes` of a log file, for failure diagnostics.
    #[must_use]
    pub fn log_tail(log_path: &Utf8Path, max_bytes: usize) -> String {
        let Ok(bytes) = fs::read(log_path) else {
            return String::new();
        };
        let start = bytes.len().saturating_sub(max_bytes);
        String::from_utf8_lossy(&bytes[start..]).into_owned()
    }

    /// Directory holding the file-only host backend state.
    #[must_use]
    pub fn host_dir(&self) -> Utf8PathBuf {
        self.root.join(HOST_DIR)
    }
}
