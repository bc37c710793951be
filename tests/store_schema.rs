//! Required-field enforcement on workspace reads.
//!
//! Missing files are `NotFound`; corrupt or incomplete files are `Schema`
//! errors. Nothing is ever silently defaulted: a session that reads broken
//! state fails with a diagnostic instead of repairing it.

use camino::Utf8PathBuf;
use serde_json::json;

use overseer::error::StoreError;
use overseer::store::{WorkspaceStore, MILESTONE_FILE, WORKSPACE_INFO_FILE};

fn store(td: &tempfile::TempDir) -> WorkspaceStore {
    let project = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
    WorkspaceStore::open(&project, "todo-app", "abcde")
}

fn workspace_info_json(overrides: &[(&str, &str)]) -> Vec<u8> {
    let mut value = json!({
        "spec_slug": "todo-app",
        "spec_hash": "abcde",
        "feature_branch": "feature/todo-app-abcde",
        "target_branch": "main",
        "auto_accept": false,
    });
    for (field, replacement) in overrides {
        value[*field] = json!(replacement);
    }
    serde_json::to_vec(&value).unwrap()
}

#[test]
fn missing_workspace_files_read_as_not_found() {
    let td = tempfile::TempDir::new().unwrap();
    let store = store(&td);

    let err = store.workspace_info().unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }), "got: {err}");

    let err = store.milestone().unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }), "got: {err}");
}

#[test]
fn workspace_info_rejects_each_empty_required_field() {
    let td = tempfile::TempDir::new().unwrap();
    let store = store(&td);

    for field in ["spec_slug", "spec_hash", "feature_branch", "target_branch"] {
        store
            .write_bytes(WORKSPACE_INFO_FILE, &workspace_info_json(&[(field, "")]))
            .unwrap();
        let err = store.workspace_info().unwrap_err();
        assert!(
            matches!(&err, StoreError::Schema { reason, .. } if reason.contains(field)),
            "empty {field} must be a schema error naming it, got: {err}"
        );
    }

    // The untampered document reads back fine.
    store
        .write_bytes(WORKSPACE_INFO_FILE, &workspace_info_json(&[]))
        .unwrap();
    let info = store.workspace_info().unwrap();
    assert_eq!(info.spec_slug, "todo-app");
}

#[test]
fn workspace_info_with_missing_fields_is_a_schema_error() {
    let td = tempfile::TempDir::new().unwrap();
    let store = store(&td);
    store
        .write_bytes(WORKSPACE_INFO_FILE, br#"{"spec_slug":"todo-app"}"#)
        .unwrap();

    let err = store.workspace_info().unwrap_err();
    assert!(matches!(err, StoreError::Schema { .. }), "got: {err}");
}

#[test]
fn milestone_missing_identity_is_a_schema_error() {
    let td = tempfile::TempDir::new().unwrap();
    let store = store(&td);
    store
        .write_bytes(MILESTONE_FILE, br#"{"repository":"group/todo"}"#)
        .unwrap();

    let err = store.milestone().unwrap_err();
    assert!(matches!(err, StoreError::Schema { .. }), "got: {err}");
}

#[test]
fn milestone_empty_title_is_a_schema_error() {
    let td = tempfile::TempDir::new().unwrap();
    let store = store(&td);
    let milestone = json!({
        "repository": "group/todo",
        "milestone_id": 1,
        "milestone_title": "   ",
        "feature_branch": "feature/todo-app-abcde",
        "issues": [],
        "all_issues_closed": false,
        "session_files": {
            "tracked": [],
            "session_started": "2026-08-02T00:00:00Z",
            "last_updated": "2026-08-02T00:00:00Z",
        },
    });
    store
        .write_bytes(MILESTONE_FILE, &serde_json::to_vec(&milestone).unwrap())
        .unwrap();

    let err = store.milestone().unwrap_err();
    assert!(
        matches!(&err, StoreError::Schema { reason, .. } if reason.contains("milestone_title")),
        "got: {err}"
    );
}

#[test]
fn corrupt_json_is_a_schema_error_not_a_default() {
    let td = tempfile::TempDir::new().unwrap();
    let store = store(&td);
    store
        .write_bytes(WORKSPACE_INFO_FILE, b"{\"spec_slug\": \"todo")
        .unwrap();

    let err = store.workspace_info().unwrap_err();
    assert!(matches!(err, StoreError::Schema { .. }), "got: {err}");
}
