//! Agent registry persistence
//!
//! The daemon owns every `AgentRecord` and rewrites the whole registry file
//! atomically on each change. On startup the registry is reconciled: any
//! record whose pid is no longer live moves to a terminal status, so a client
//! reconnecting after a daemon restart sees truthful state.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::atomic_write::write_json_atomic;
use crate::error::StoreError;
use crate::types::{AgentRecord, AgentStatus, ModeFlags, Phase};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    next_agent_id: u64,
    agents: BTreeMap<u64, AgentRecord>,
}

/// In-memory registry with write-through persistence.
#[derive(Debug)]
pub struct Registry {
    path: Utf8PathBuf,
    file: RegistryFile,
}

/// Fields a new agent record is created from.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub spec_slug: String,
    pub spec_hash: String,
    pub project_dir: Utf8PathBuf,
    pub feature_branch: String,
    pub target_branch: String,
    pub auto_accept: bool,
    pub mode_flags: ModeFlags,
}

impl Registry {
    /// Load the registry, or start empty when the file does not exist.
    pub fn load_or_default(path: &Utf8Path) -> Result<Self, StoreError> {
        let file = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StoreError::Schema {
                path: path.to_string(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryFile::default(),
            Err(e) => return Err(StoreError::io("read", path.as_str(), e)),
        };
        Ok(Self {
            path: path.to_owned(),
            file,
        })
    }

    /// Persist the whole registry atomically.
    pub fn save(&self) -> Result<(), StoreError> {
        write_json_atomic(&self.path, &self.file)
    }

    /// Create a new record with the next monotonic id.
    pub fn allocate(&mut self, new: NewAgent) -> Result<AgentRecord, StoreError> {
        self.file.next_agent_id += 1;
        let record = AgentRecord {
            agent_id: self.file.next_agent_id,
            spec_slug: new.spec_slug,
            spec_hash: new.spec_hash,
            project_dir: new.project_dir,
            feature_branch: new.feature_branch,
            target_branch: new.target_branch,
            auto_accept: new.auto_accept,
            mode_flags: new.mode_flags,
            log_path: None,
            pid: None,
            status: AgentStatus::Idle,
            phase: Phase::Initializer,
            last_event_at: Utc::now(),
            last_error: None,
        };
        self.file.agents.insert(record.agent_id, record.clone());
        self.save()?;
        Ok(record)
    }

    #[must_use]
    pub fn get(&self, agent_id: u64) -> Option<&AgentRecord> {
        self.file.agents.get(&agent_id)
    }

    /// Apply a mutation to a record and persist. Stamps `last_event_at`.
    pub fn update(
        &mut self,
        agent_id: u64,
        f: impl FnOnce(&mut AgentRecord),
    ) -> Result<Option<AgentRecord>, StoreError> {
        let Some(record) = self.file.agents.get_mut(&agent_id) else {
            return Ok(None);
        };
        f(record);
        record.last_event_at = Utc::now();
        let snapshot = record.clone();
        self.save()?;
        Ok(Some(snapshot))
    }

    /// Remove a record and persist.
    pub fn remove(&mut self, agent_id: u64) -> Result<Option<AgentRecord>, StoreError> {
        let removed = self.file.agents.remove(&agent_id);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn records(&self) -> impl Iterator<Item = &AgentRecord> {
        self.file.agents.values()
    }

    /// Find a live agent for the same run identity, used to refuse duplicate
    /// starts.
    #[must_use]
    pub fn find_live_run(&self, project_dir: &Utf8Path, spec_slug: &str, spec_hash: &str) -> Option<&AgentRecord> {
        self.file.agents.values().find(|r| {
            r.project_dir == project_dir
                && r.spec_slug == spec_slug
                && r.spec_hash == spec_hash
                && matches!(r.status, AgentStatus::Running | AgentStatus::WaitingCheckpoint)
        })
    }

    /// Startup reconciliation: records whose pid is gone move to a terminal
    /// status. Returns the ids that changed.
    pub fn reconcile(&mut self) -> Result<Vec<u64>, StoreError> {
        let mut changed = Vec::new();
        for record in self.file.agents.values_mut() {
            let dead_pid = record.pid.is_some_and(|pid| !pid_alive(pid));
            if dead_pid {
                record.pid = None;
                if record.status == AgentStatus::Running {
                    record.status = AgentStatus::Stopped;
                    record.last_event_at = Utc::now();
                }
                changed.push(record.agent_id);
            } else if record.pid.is_none() && record.status == AgentStatus::Running {
                // Running without a pid is a record the previous daemon never
                // finished writing; treat the session as gone.
                record.status = AgentStatus::Stopped;
                record.last_event_at = Utc::now();
                changed.push(record.agent_id);
            }
        }
        if !changed.is_empty() {
            self.save()?;
        }
        Ok(changed)
    }
}

/// Probe pid liveness. EPERM still means the process exists.
#[cfg(unix)]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    // A pid outside i32 range cannot name a process; a wrapped negative
    // value would probe a process group instead.
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
#[must_use]
pub fn pid_alive(_pid: u32) -> bool {
    false
}
