//! File-only host backend
//!
//! Feature-equivalent stand-in for an external issue/MR host, backed by a
//! single JSON file under the workspace's `host/` directory. Used when
//! `file_only_mode` is set, and by every integration test.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::atomic_write::write_json_atomic;
use crate::error::{HostError, StoreError};
use crate::types::{Issue, IssueState};

use super::{CommitRef, IssueHost, MergeRequestRef, MilestoneRef, PushFile};

const TRACKER_FILE: &str = "tracker";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MilestoneRecord {
    id: u64,
    title: String,
    description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IssueRecord {
    milestone_id: u64,
    #[serde(flatten)]
    issue: Issue,
    #[serde(default)]
    notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BranchRecord {
    name: String,
    from: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TrackerState {
    next_milestone_id: u64,
    next_issue_iid: u64,
    next_mr_iid: u64,
    milestones: Vec<MilestoneRecord>,
    issues: Vec<IssueRecord>,
    branches: Vec<BranchRecord>,
    commits: Vec<CommitRef>,
    merge_requests: Vec<MergeRequestRef>,
}

/// Host backed by local JSON under the workspace.
#[derive(Debug, Clone)]
pub struct FileOnlyHost {
    dir: Utf8PathBuf,
    repository: String,
}

impl FileOnlyHost {
    #[must_use]
    pub fn new(host_dir: &Utf8Path, repository: &str) -> Self {
        Self {
            dir: host_dir.to_owned(),
            repository: repository.to_string(),
        }
    }

    fn tracker_path(&self) -> Utf8PathBuf {
        self.dir.join(TRACKER_FILE)
    }

    fn load(&self) -> Result<TrackerState, HostError> {
        let path = self.tracker_path();
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                HostError::Store(StoreError::Schema {
                    path: path.to_string(),
                    reason: e.to_string(),
                })
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TrackerState::default()),
            Err(e) => Err(HostError::Store(StoreError::io("read", path.as_str(), e))),
        }
    }

    fn save(&self, state: &TrackerState) -> Result<(), HostError> {
        write_json_atomic(&self.tracker_path(), state).map_err(HostError::Store)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut TrackerState) -> Result<T, HostError>) -> Result<T, HostError> {
        let mut state = self.load()?;
        let result = f(&mut state)?;
        self.save(&state)?;
        Ok(result)
    }
}

impl IssueHost for FileOnlyHost {
    fn repository(&self) -> &str {
        &self.repository
    }

    fn create_milestone(&self, title: &str, description: &str) -> Result<MilestoneRef, HostError> {
        self.mutate(|state| {
            state.next_milestone_id += 1;
            let record = MilestoneRecord {
                id: state.next_milestone_id,
                title: title.to_string(),
                description: description.to_string(),
            };
            let milestone = MilestoneRef {
                id: record.id,
                title: record.title.clone(),
            };
            state.milestones.push(record);
            Ok(milestone)
        })
    }

    fn create_issue(
        &self,
        milestone_id: u64,
        title: &str,
        description: &str,
        labels: &[String],
    ) -> Result<Issue, HostError> {
        self.mutate(|state| {
            if !state.milestones.iter().any(|m| m.id == milestone_id) {
                return Err(HostError::NotFound {
                    op: "create_issue",
                    what: format!("milestone {milestone_id}"),
                });
            }
            state.next_issue_iid += 1;
            let issue = Issue {
                iid: state.next_issue_iid,
                title: title.to_string(),
                description: description.to_string(),
                labels: labels.to_vec(),
                state: IssueState::Open,
                enrichment: None,
            };
            state.issues.push(IssueRecord {
                milestone_id,
                issue: issue.clone(),
                notes: Vec::new(),
            });
            Ok(issue)
        })
    }

    fn update_issue(
        &self,
        iid: u64,
        new_state: IssueState,
        labels: Option<Vec<String>>,
    ) -> Result<(), HostError> {
        self.mutate(|state| {
            let record = state
                .issues
                .iter_mut()
                .find(|r| r.issue.iid == iid)
                .ok_or_else(|| HostError::NotFound {
                    op: "update_issue",
                    what: format!("issue {iid}"),
                })?;
            record.issue.state = new_state;
            if let Some(labels) = labels {
                record.issue.labels = labels;
            }
            Ok(())
        })
    }

    fn add_note(&self, iid: u64, body: &str) -> Result<(), HostError> {
        self.mutate(|state| {
            let record = state
                .issues
                .iter_mut()
                .find(|r| r.issue.iid == iid)
                .ok_or_else(|| HostError::NotFound {
                    op: "add_note",
                    what: format!("issue {iid}"),
                })?;
            record.notes.push(body.to_string());
            Ok(())
        })
    }

    fn create_branch(&self, name: &str, from: &str) -> Result<(), HostError> {
        self.mutate(|state| {
            if !state.branches.iter().any(|b| b.name == name) {
                state.branches.push(BranchRecord {
                    name: name.to_string(),
                    from: from.to_string(),
                });
            }
            Ok(())
        })
    }

    fn push_files(
        &self,
        branch: &str,
        commit_message: &str,
        files: &[PushFile],
    ) -> Result<CommitRef, HostError> {
        self.mutate(|state| {
            if !state.branches.iter().any(|b| b.name == branch) {
                return Err(HostError::NotFound {
                    op: "push_files",
                    what: format!("branch {branch}"),
                });
            }
            let mut hasher = blake3::Hasher::new();
            hasher.update(branch.as_bytes());
            hasher.update(commit_message.as_bytes());
            for file in files {
                hasher.update(file.path.as_bytes());
                hasher.update(file.content.as_bytes());
            }
            hasher.update(&state.commits.len().to_le_bytes());
            let commit = CommitRef {
                sha: hasher.finalize().to_hex()[..40].to_string(),
                branch: branch.to_string(),
                message: commit_message.to_string(),
                committed_at: Utc::now(),
            };
            state.commits.push(commit.clone());
            Ok(commit)
        })
    }

    fn list_commits(&self, branch: &str) -> Result<Vec<CommitRef>, HostError> {
        let state = self.load()?;
        Ok(state
            .commits
            .iter()
            .filter(|c| c.branch == branch)
            .cloned()
            .collect())
    }

    fn create_merge_request(
        &self,
        source_branch: &str,
        target_branch: &str,
        title: &str,
        description: &str,
    ) -> Result<MergeRequestRef, HostError> {
        self.mutate(|state| {
            state.next_mr_iid += 1;
            let mr = MergeRequestRef {
                iid: state.next_mr_iid,
                url: format!("file-only://{}/merge_requests/{}", self.repository, state.next_mr_iid),
                title: title.to_string(),
                description: description.to_string(),
                source_branch: source_branch.to_string(),
                target_branch: target_branch.to_string(),
            };
            state.merge_requests.push(mr.clone());
            Ok(mr)
        })
    }

    fn get_merge_request(&self, iid: u64) -> Result<Option<MergeRequestRef>, HostError> {
        let state = self.load()?;
        Ok(state.merge_requests.iter().find(|m| m.iid == iid).cloned())
    }

    fn list_milestone_issues(
        &self,
        milestone_id: u64,
        state_filter: Option<IssueState>,
    ) -> Result<Vec<Issue>, HostError> {
        let state = self.load()?;
        Ok(state
            .issues
            .iter()
            .filter(|r| r.milestone_id == milestone_id)
            .filter(|r| state_filter.map_or(true, |s| r.issue.state == s))
            .map(|r| r.issue.clone())
            .collect())
    }
}
