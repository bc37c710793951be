//! File-ownership discipline on pushes.
//!
//! A session may only push paths recorded in its `SessionFiles`; local edits
//! the session never touched stay local, and paths that climb out of the
//! project root are rejected outright.

use camino::Utf8PathBuf;
use chrono::Utc;

use overseer::error::HostError;
use overseer::host::{push_session_files, FileOnlyHost, IssueHost, PushFile, RetryPolicy};
use overseer::store::WorkspaceStore;
use overseer::types::{Milestone, SessionFiles};

fn fixture() -> (tempfile::TempDir, WorkspaceStore, FileOnlyHost) {
    let td = tempfile::TempDir::new().unwrap();
    let project = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
    let store = WorkspaceStore::open(&project, "todo-app", "abcde");

    let milestone = Milestone {
        repository: "local/todo".into(),
        milestone_id: 1,
        milestone_title: "Todo app".into(),
        feature_branch: "feature/todo-app-abcde".into(),
        issues: Vec::new(),
        all_issues_closed: false,
        completed_at: None,
        merge_request_iid: None,
        merge_request_url: None,
        session_files: SessionFiles::fresh(Utc::now()),
    };
    store.write_milestone(&milestone).unwrap();

    let host = FileOnlyHost::new(&store.host_dir(), "local/todo");
    host.create_branch("feature/todo-app-abcde", "main").unwrap();
    (td, store, host)
}

fn push_file(path: &str) -> PushFile {
    PushFile {
        path: path.to_string(),
        content: format!("// {path}"),
    }
}

#[test]
fn only_session_tracked_files_may_be_pushed() {
    let (_td, store, host) = fixture();

    // The session edits a.x, b.x, c.x; d.x is a pre-existing local edit the
    // session never touched.
    store.track_files(["a.x", "b.x", "c.x"]).unwrap();

    let tracked = [push_file("a.x"), push_file("b.x"), push_file("c.x")];
    let commit = push_session_files(
        &host,
        &store,
        RetryPolicy::immediate(3),
        "feature/todo-app-abcde",
        "implement features",
        &tracked,
    )
    .unwrap();
    assert_eq!(commit.branch, "feature/todo-app-abcde");

    let with_untracked = [push_file("a.x"), push_file("d.x")];
    let err = push_session_files(
        &host,
        &store,
        RetryPolicy::immediate(3),
        "feature/todo-app-abcde",
        "sneaky extra file",
        &with_untracked,
    )
    .unwrap_err();
    assert!(matches!(err, HostError::UntrackedFile { path } if path == "d.x"));

    // The rejected push left nothing behind.
    let commits = host.list_commits("feature/todo-app-abcde").unwrap();
    assert_eq!(commits.len(), 1);
}

#[test]
fn session_reset_revokes_push_rights() {
    let (_td, store, host) = fixture();
    store.track_files(["a.x"]).unwrap();

    // A new session starts with an empty whitelist; yesterday's files are no
    // longer pushable.
    store.begin_session(Utc::now()).unwrap();
    let err = push_session_files(
        &host,
        &store,
        RetryPolicy::immediate(3),
        "feature/todo-app-abcde",
        "stale file",
        &[push_file("a.x")],
    )
    .unwrap_err();
    assert!(matches!(err, HostError::UntrackedFile { .. }));
}

#[test]
fn escaping_paths_are_rejected_even_when_tracked() {
    let (_td, store, host) = fixture();
    store
        .track_files(["../outside.x", "/etc/passwd", "nested/../../outside.x"])
        .unwrap();

    for path in ["../outside.x", "/etc/passwd", "nested/../../outside.x"] {
        let err = push_session_files(
            &host,
            &store,
            RetryPolicy::immediate(3),
            "feature/todo-app-abcde",
            "escape attempt",
            &[push_file(path)],
        )
        .unwrap_err();
        assert!(matches!(err, HostError::PathEscape { .. }), "path {path} slipped through");
    }
    assert!(host.list_commits("feature/todo-app-abcde").unwrap().is_empty());
}
