//! Issue/MR host integrations
//!
//! The core never talks to a real tracker itself; it consumes this trait.
//! Two behaviors live here rather than in any backend:
//!
//! * bounded retry with exponential backoff for transient failures;
//! * the push guard: only files tracked in the current `SessionFiles` may be
//!   pushed, and no path may escape the project root.

pub mod file_backend;

pub use file_backend::FileOnlyHost;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Component;
use std::time::Duration;

use crate::error::HostError;
use crate::store::WorkspaceStore;
use crate::types::{Issue, IssueState, SessionFiles};

/// Reference to a milestone on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneRef {
    pub id: u64,
    pub title: String,
}

/// Reference to a commit on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRef {
    pub sha: String,
    pub branch: String,
    pub message: String,
    pub committed_at: DateTime<Utc>,
}

/// Reference to a merge request on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequestRef {
    pub iid: u64,
    pub url: String,
    pub title: String,
    pub description: String,
    pub source_branch: String,
    pub target_branch: String,
}

/// One file in a push: project-relative path plus full content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushFile {
    pub path: String,
    pub content: String,
}

/// Operations the core consumes from an issue/MR host.
///
/// The file-only backend implements the same surface over local JSON, so the
/// whole lifecycle runs without an external service.
pub trait IssueHost: Send + Sync {
    /// Logical repository path (e.g. `group/project`) recorded in milestone
    /// state.
    fn repository(&self) -> &str;

    fn create_milestone(&self, title: &str, description: &str) -> Result<MilestoneRef, HostError>;

    fn create_issue(
        &self,
        milestone_id: u64,
        title: &str,
        description: &str,
        labels: &[String],
    ) -> Result<Issue, HostError>;

    fn update_issue(
        &self,
        iid: u64,
        state: IssueState,
        labels: Option<Vec<String>>,
    ) -> Result<(), HostError>;

    fn add_note(&self, iid: u64, body: &str) -> Result<(), HostError>;

    fn create_branch(&self, name: &str, from: &str) -> Result<(), HostError>;

    fn push_files(
        &self,
        branch: &str,
        commit_message: &str,
        files: &[PushFile],
    ) -> Result<CommitRef, HostError>;

    fn list_commits(&self, branch: &str) -> Result<Vec<CommitRef>, HostError>;

    fn create_merge_request(
        &self,
        source_branch: &str,
        target_branch: &str,
        title: &str,
        description: &str,
    ) -> Result<MergeRequestRef, HostError>;

    fn get_merge_request(&self, iid: u64) -> Result<Option<MergeRequestRef>, HostError>;

    fn list_milestone_issues(
        &self,
        milestone_id: u64,
        state: Option<IssueState>,
    ) -> Result<Vec<Issue>, HostError>;
}

/// Bounded retry for transient host failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// No-delay policy for tests.
    #[must_use]
    pub const fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay: Duration::ZERO,
        }
    }
}

/// Run `f`, retrying transient failures with exponential backoff. Permanent
/// failures surface on first occurrence; the last transient error surfaces
/// after the attempts are exhausted.
pub fn with_retry<T>(
    policy: RetryPolicy,
    op: &str,
    mut f: impl FnMut() -> Result<T, HostError>,
) -> Result<T, HostError> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < policy.attempts => {
                let delay = policy.base_delay * 2u32.pow(attempt);
                tracing::warn!(op, attempt = attempt + 1, error = %err, "transient host failure, retrying");
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Reject paths that are absolute or climb out of the project root.
pub fn check_path_within_project(path: &str) -> Result<(), HostError> {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        return Err(HostError::PathEscape {
            path: path.to_string(),
        });
    }
    let mut depth: i64 = 0;
    for component in p.components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(HostError::PathEscape {
                        path: path.to_string(),
                    });
                }
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(HostError::PathEscape {
                    path: path.to_string(),
                })
            }
        }
    }
    Ok(())
}

/// Enforce the session file-ownership rule on a push set.
pub fn guard_push(session_files: &SessionFiles, files: &[PushFile]) -> Result<(), HostError> {
    for file in files {
        check_path_within_project(&file.path)?;
        if !session_files.tracked.contains(&file.path) {
            return Err(HostError::UntrackedFile {
                path: file.path.clone(),
            });
        }
    }
    Ok(())
}

/// Push files through the host with the ownership guard applied against the
/// workspace's current session record. This is the only push entry point the
/// orchestrator and CLI use.
pub fn push_session_files(
    host: &dyn IssueHost,
    store: &WorkspaceStore,
    policy: RetryPolicy,
    branch: &str,
    commit_message: &str,
    files: &[PushFile],
) -> Result<CommitRef, HostError> {
    let milestone = store.milestone()?;
    guard_push(&milestone.session_files, files)?;
    with_retry(policy, "push_files", || host.push_files(branch, commit_message, files))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_gives_up_after_bounded_attempts() {
        let mut calls = 0;
        let result: Result<(), HostError> = with_retry(RetryPolicy::immediate(3), "create_issue", || {
            calls += 1;
            Err(HostError::Transient {
                op: "create_issue",
                reason: "503".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_does_not_retry_permanent_failures() {
        let mut calls = 0;
        let result: Result<(), HostError> = with_retry(RetryPolicy::immediate(3), "create_issue", || {
            calls += 1;
            Err(HostError::Auth { op: "create_issue" })
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn retry_recovers_when_a_later_attempt_succeeds() {
        let mut calls = 0;
        let result = with_retry(RetryPolicy::immediate(3), "list_commits", || {
            calls += 1;
            if calls < 3 {
                Err(HostError::Transient {
                    op: "list_commits",
                    reason: "timeout".into(),
                })
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn path_escapes_are_rejected() {
        assert!(check_path_within_project("src/main.rs").is_ok());
        assert!(check_path_within_project("a/../b.rs").is_ok());
        assert!(check_path_within_project("../outside.rs").is_err());
        assert!(check_path_within_project("a/../../outside.rs").is_err());
        assert!(check_path_within_project("/etc/passwd").is_err());
    }

    #[test]
    fn guard_rejects_untracked_files() {
        let mut session = SessionFiles::fresh(Utc::now());
        session.tracked = vec!["src/a.rs".into(), "src/b.rs".into()];

        let ok = [PushFile {
            path: "src/a.rs".into(),
            content: String::new(),
        }];
        guard_push(&session, &ok).unwrap();

        let bad = [PushFile {
            path: "src/d.rs".into(),
            content: String::new(),
        }];
        let err = guard_push(&session, &bad).unwrap_err();
        assert!(matches!(err, HostError::UntrackedFile { .. }));
    }
}
