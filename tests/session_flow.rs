//! End-to-end session flows driven through the stub agent subprocess.
//!
//! Covers the resumption gate, the full milestone lifecycle under
//! auto-accept, the closure rejection round-trip, regression handling, and
//! the quality gate on terminal checkpoints.

use camino::Utf8PathBuf;
use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;

use overseer::checkpoint::CheckpointEngine;
use overseer::error::{HarnessError, StoreError};
use overseer::host::{FileOnlyHost, RetryPolicy};
use overseer::orchestrator::{Orchestrator, OrchestratorConfig, SessionEnd};
use overseer::store::{WorkspaceStore, APP_SPEC_FILE};
use overseer::types::{
    Checkpoint, CheckpointKind, CheckpointStatus, IssueState, Milestone, ModeFlags, Phase, Scope,
    SessionFiles, Verdict,
};

const SPEC_TEXT: &str = "Build a small todo application: an add command, a list command, and a \
complete command. State persists to a local JSON file between invocations.";

struct Fixture {
    _td: tempfile::TempDir,
    store: WorkspaceStore,
    engine: CheckpointEngine,
}

fn fixture(auto_accept: bool) -> Fixture {
    let td = tempfile::TempDir::new().unwrap();
    let project = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
    let spec_file = project.join("todo-app.txt");
    std::fs::write(spec_file.as_std_path(), SPEC_TEXT).unwrap();

    let (store, _info) =
        WorkspaceStore::bootstrap(&project, &spec_file, "main", auto_accept, ModeFlags::default())
            .unwrap();
    let engine = CheckpointEngine::new(store.clone());
    Fixture {
        _td: td,
        store,
        engine,
    }
}

fn orchestrator(fx: &Fixture, agent_args: &[&str]) -> Orchestrator {
    let log_path = fx.store.new_session_log(1).unwrap();
    let mut config = OrchestratorConfig::new(1, env!("CARGO_BIN_EXE_agent-stub"), log_path);
    config.agent_args = agent_args.iter().map(ToString::to_string).collect();
    config.retry = RetryPolicy::immediate(3);
    config.stop_grace = std::time::Duration::from_millis(500);

    let host = Box::new(FileOnlyHost::new(&fx.store.host_dir(), "local/test"));
    Orchestrator::new(fx.store.clone(), host, config)
}

async fn run_once(orchestrator: &Orchestrator) -> SessionEnd {
    let (_tx, rx) = watch::channel(false);
    orchestrator.run_session(rx).await.unwrap()
}

fn approve(fx: &Fixture, checkpoint: &Checkpoint) {
    let modifications = match checkpoint.kind {
        CheckpointKind::RegressionApproval => Some(json!({ "human_decision": "fix_now" })),
        _ => None,
    };
    fx.engine
        .resolve(&checkpoint.checkpoint_id, Verdict::Approved, modifications, None)
        .unwrap();
}

/// Run sessions, approving every gate, until a pending checkpoint of `kind`
/// appears. Panics when the flow stalls.
async fn advance_until_pending(
    fx: &Fixture,
    orchestrator: &Orchestrator,
    kind: CheckpointKind,
) -> Checkpoint {
    for _ in 0..40 {
        match run_once(orchestrator).await {
            SessionEnd::WaitingCheckpoint { checkpoint } => {
                if checkpoint.kind == kind {
                    return checkpoint;
                }
                approve(fx, &checkpoint);
            }
            SessionEnd::Continue { .. } => {}
            other => panic!("flow ended early while waiting for {kind}: {other:?}"),
        }
    }
    panic!("no pending {kind} checkpoint after 40 sessions");
}

#[tokio::test]
async fn auto_accept_runs_the_whole_milestone_to_done() {
    let fx = fixture(true);
    let orchestrator = orchestrator(&fx, &["--issues", "3"]);

    let mut sessions = 0;
    loop {
        sessions += 1;
        assert!(sessions < 40, "run did not converge");
        match run_once(&orchestrator).await {
            SessionEnd::Done => break,
            SessionEnd::Continue { .. } => {}
            other => panic!("unexpected session end under auto-accept: {other:?}"),
        }
    }

    let milestone = fx.store.milestone().unwrap();
    assert_eq!(milestone.issues.len(), 3);
    assert!(milestone.all_issues_closed);
    assert!(milestone.merge_request_iid.is_some());
    assert!(milestone.merge_request_url.is_some());
    assert!(milestone.issues.iter().all(|i| i.state == IssueState::Closed));

    // Every gate in the log was resolved and acted on.
    let log = fx.engine.log().unwrap();
    assert!(log.iter().count() >= 8);
    for checkpoint in log.iter() {
        assert_ne!(checkpoint.status, CheckpointStatus::Pending);
        assert!(checkpoint.completed, "{} left un-completed", checkpoint.checkpoint_id);
        assert!(checkpoint.resolved_at.is_some());
        assert!(checkpoint.completed_at.is_some());
    }

    // The three closures live under their issue scopes.
    for iid in 1..=3u64 {
        assert!(
            log.scopes.get(&iid.to_string()).is_some_and(|c| !c.is_empty()),
            "no scoped checkpoint for issue {iid}"
        );
    }
}

#[tokio::test]
async fn pending_gate_suspends_without_rerunning_earlier_steps() {
    let fx = fixture(false);
    let orchestrator = orchestrator(&fx, &[]);

    // Session 1 proposes the project and suspends.
    let first = match run_once(&orchestrator).await {
        SessionEnd::WaitingCheckpoint { checkpoint } => checkpoint,
        other => panic!("expected suspension, got {other:?}"),
    };
    assert_eq!(first.kind, CheckpointKind::ProjectVerification);
    assert!(!fx.store.milestone_exists());

    // Still pending: another session must not run the subprocess again.
    let again = match run_once(&orchestrator).await {
        SessionEnd::WaitingCheckpoint { checkpoint } => checkpoint,
        other => panic!("expected continued suspension, got {other:?}"),
    };
    assert_eq!(again.checkpoint_id, first.checkpoint_id);

    approve(&fx, &first);

    // The next session runs the continuation (milestone + branch), then the
    // subprocess proposes issues.
    let second = match run_once(&orchestrator).await {
        SessionEnd::WaitingCheckpoint { checkpoint } => checkpoint,
        other => panic!("expected issue breakdown gate, got {other:?}"),
    };
    assert_eq!(second.kind, CheckpointKind::SpecToIssues);
    assert!(fx.store.milestone_exists());

    // The earlier step was not re-executed: exactly one verification gate.
    let log = fx.engine.log().unwrap();
    let verifications = log
        .iter()
        .filter(|c| c.kind == CheckpointKind::ProjectVerification)
        .count();
    assert_eq!(verifications, 1);
    let completed = log.find(&first.checkpoint_id).unwrap();
    assert!(completed.completed, "approved gate was acted on and completed");
}

#[tokio::test]
async fn rejected_closure_round_trips_through_a_fresh_checkpoint() {
    let fx = fixture(false);
    let orchestrator = orchestrator(&fx, &["--issues", "2"]);

    let closure = advance_until_pending(&fx, &orchestrator, CheckpointKind::IssueClosure).await;
    let iid = match closure.scope {
        Scope::Issue(iid) => iid,
        Scope::Global => panic!("closure must be issue-scoped"),
    };

    fx.engine
        .resolve(
            &closure.checkpoint_id,
            Verdict::Rejected,
            None,
            Some("missing test for empty input".into()),
        )
        .unwrap();

    // The next session surfaces the feedback and produces a fresh closure
    // gate; the rejected one stays un-completed.
    let fresh = match run_once(&orchestrator).await {
        SessionEnd::WaitingCheckpoint { checkpoint } => checkpoint,
        other => panic!("expected a fresh closure gate, got {other:?}"),
    };
    assert_eq!(fresh.kind, CheckpointKind::IssueClosure);
    assert_eq!(fresh.scope, Scope::Issue(iid));
    assert_ne!(fresh.checkpoint_id, closure.checkpoint_id);

    let log = fx.engine.log().unwrap();
    let old = log.find(&closure.checkpoint_id).unwrap();
    assert_eq!(old.status, CheckpointStatus::Rejected);
    assert!(!old.completed);

    // Approving the fresh gate closes the issue and completes both entries,
    // the superseded rejection first.
    approve(&fx, &fresh);
    match run_once(&orchestrator).await {
        SessionEnd::WaitingCheckpoint { .. } | SessionEnd::Continue { .. } => {}
        other => panic!("unexpected end after closure approval: {other:?}"),
    }

    let log = fx.engine.log().unwrap();
    let old = log.find(&closure.checkpoint_id).unwrap();
    let new = log.find(&fresh.checkpoint_id).unwrap();
    assert!(old.completed && new.completed);
    assert!(old.completed_at.unwrap() <= new.completed_at.unwrap());
    assert_eq!(
        fx.store.milestone().unwrap().issue(iid).unwrap().state,
        IssueState::Closed
    );
}

#[tokio::test]
async fn auto_accept_enrichment_uses_the_recommended_order() {
    let fx = fixture(true);
    let orchestrator = orchestrator(&fx, &[]);

    // Run until the enrichment gate has been created and auto-resolved.
    for _ in 0..10 {
        match run_once(&orchestrator).await {
            SessionEnd::Continue { .. } => {}
            SessionEnd::Done => break,
            other => panic!("unexpected end: {other:?}"),
        }
        let enrichment = fx
            .engine
            .latest_of_kind(CheckpointKind::IssueEnrichment)
            .unwrap();
        if enrichment.is_some() {
            break;
        }
    }

    let enrichment = fx
        .engine
        .latest_of_kind(CheckpointKind::IssueEnrichment)
        .unwrap()
        .expect("enrichment gate was created");
    assert_eq!(enrichment.status, CheckpointStatus::Approved);
    let recommended = enrichment.context["recommended_enrichment_order"].clone();
    assert_eq!(
        enrichment.modifications.unwrap()["enrichment_order"],
        recommended
    );
}

#[tokio::test]
async fn deferred_regression_spawns_a_tracking_issue() {
    let fx = fixture(false);
    let orchestrator = orchestrator(&fx, &["--issues", "2", "--regressed-issue", "1"]);

    let regression =
        advance_until_pending(&fx, &orchestrator, CheckpointKind::RegressionApproval).await;
    assert_eq!(regression.context["regressed_issue"], json!(1));

    fx.engine
        .resolve(
            &regression.checkpoint_id,
            Verdict::Approved,
            Some(json!({ "human_decision": "defer" })),
            None,
        )
        .unwrap();

    // The continuation creates a tracking issue, then normal selection
    // resumes for the planned work.
    let next = match run_once(&orchestrator).await {
        SessionEnd::WaitingCheckpoint { checkpoint } => checkpoint,
        other => panic!("expected selection to resume, got {other:?}"),
    };
    assert_eq!(next.kind, CheckpointKind::IssueSelection);

    let milestone = fx.store.milestone().unwrap();
    let tracker = milestone
        .issues
        .iter()
        .find(|i| i.title.contains("Regression in issue #1"))
        .expect("tracking issue exists");
    assert_eq!(tracker.state, IssueState::Open);
    assert!(tracker.labels.iter().any(|l| l == "regression"));
    assert!(!milestone.all_issues_closed);
}

#[tokio::test]
async fn failing_quality_checks_block_the_closure_gate() {
    let fx = fixture(false);
    let orchestrator = orchestrator(&fx, &["--issues", "1", "--failing-tests"]);

    let selection = advance_until_pending(&fx, &orchestrator, CheckpointKind::IssueSelection).await;
    approve(&fx, &selection);

    // The implementation session records failing checks and must not request
    // closure.
    match run_once(&orchestrator).await {
        SessionEnd::Continue { phase } => assert_eq!(phase, Phase::Coding),
        other => panic!("expected a clean session without closure, got {other:?}"),
    }

    let log = fx.engine.log().unwrap();
    assert!(
        log.iter().all(|c| c.kind != CheckpointKind::IssueClosure),
        "closure gate must not exist while checks fail"
    );
    let report = fx.store.quality_report().unwrap().unwrap();
    assert!(!report.all_passing());
}

#[tokio::test]
async fn a_clean_exit_with_the_failure_sentinel_still_fails() {
    let fx = fixture(false);
    let orchestrator = orchestrator(&fx, &["--scenario", "sentinel"]);

    match run_once(&orchestrator).await {
        SessionEnd::Failed { message, log_tail } => {
            assert!(message.contains("fatal error"));
            assert!(log_tail.contains("AGENT_FATAL"));
        }
        other => panic!("expected sentinel failure, got {other:?}"),
    }
}

#[tokio::test]
async fn crashing_subprocess_fails_with_log_tail_diagnostics() {
    let fx = fixture(false);
    let orchestrator = orchestrator(&fx, &["--scenario", "fail"]);

    match run_once(&orchestrator).await {
        SessionEnd::Failed { message, log_tail } => {
            assert!(message.contains("code 1"), "unexpected message: {message}");
            assert!(log_tail.contains("simulated agent failure"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn corrupt_workspace_info_fails_the_session_loudly() {
    let fx = fixture(false);
    fx.store
        .write_bytes(
            "workspace_info",
            br#"{"spec_slug":"todo-app","spec_hash":"","feature_branch":"f","target_branch":"main","auto_accept":false}"#,
        )
        .unwrap();

    let orchestrator = orchestrator(&fx, &[]);
    let (_tx, rx) = watch::channel(false);
    let err = orchestrator.run_session(rx).await.unwrap_err();
    assert!(
        matches!(err, HarnessError::Store(StoreError::Schema { .. })),
        "got: {err}"
    );
}

#[tokio::test]
async fn zero_issue_milestone_refuses_the_mr_phase() {
    let fx = fixture(false);
    // Hand-corrupted state: a milestone that claims every issue is closed
    // while holding none.
    let milestone = Milestone {
        repository: "local/test".into(),
        milestone_id: 1,
        milestone_title: "Empty milestone".into(),
        feature_branch: "feature/todo-app".into(),
        issues: Vec::new(),
        all_issues_closed: true,
        completed_at: None,
        merge_request_iid: None,
        merge_request_url: None,
        session_files: SessionFiles::fresh(Utc::now()),
    };
    fx.store.write_milestone(&milestone).unwrap();

    let orchestrator = orchestrator(&fx, &[]);
    match run_once(&orchestrator).await {
        SessionEnd::Failed { message, .. } => {
            assert!(
                message.contains("no issues"),
                "refusal must name the zero-issue milestone, got: {message}"
            );
            assert!(message.contains("MR phase"), "unexpected message: {message}");
        }
        other => panic!("expected an explicit refusal, got {other:?}"),
    }

    // No transition or review gate was created for the broken milestone.
    let log = fx.engine.log().unwrap();
    assert!(log
        .iter()
        .all(|c| !matches!(c.kind, CheckpointKind::MrPhaseTransition | CheckpointKind::MrReview)));
}

#[tokio::test]
async fn undersized_spec_is_refused_before_any_milestone_work() {
    let fx = fixture(false);
    // Corrupt the copied spec after bootstrap; the session re-checks it.
    fx.store.write_bytes(APP_SPEC_FILE, b"too small").unwrap();

    let orchestrator = orchestrator(&fx, &[]);
    match run_once(&orchestrator).await {
        SessionEnd::Failed { message, .. } => {
            assert!(message.contains("below the"), "unexpected message: {message}");
        }
        other => panic!("expected refusal, got {other:?}"),
    }
    assert!(!fx.store.milestone_exists());
    assert_eq!(fx.engine.log().unwrap().iter().count(), 0);
}

#[tokio::test]
async fn skip_mr_creation_finishes_after_the_coding_loop() {
    let td = tempfile::TempDir::new().unwrap();
    let project = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
    let spec_file = project.join("todo-app.txt");
    std::fs::write(spec_file.as_std_path(), SPEC_TEXT).unwrap();
    let mode = ModeFlags {
        skip_mr_creation: true,
        ..ModeFlags::default()
    };
    let (store, _) = WorkspaceStore::bootstrap(&project, &spec_file, "main", true, mode).unwrap();
    let fx = Fixture {
        _td: td,
        engine: CheckpointEngine::new(store.clone()),
        store,
    };
    let orchestrator = orchestrator(&fx, &["--issues", "1"]);

    let mut sessions = 0;
    loop {
        sessions += 1;
        assert!(sessions < 20, "run did not converge");
        match run_once(&orchestrator).await {
            SessionEnd::Done => break,
            SessionEnd::Continue { .. } => {}
            other => panic!("unexpected end: {other:?}"),
        }
    }

    let milestone = fx.store.milestone().unwrap();
    assert!(milestone.all_issues_closed);
    assert!(milestone.merge_request_iid.is_none(), "no MR in skip mode");
    let log = fx.engine.log().unwrap();
    assert!(log.iter().all(|c| c.kind != CheckpointKind::MrReview));
}

/// Paths escaping the project root are rejected at push time, wherever the
/// session got them from.
#[test]
fn push_path_escape_is_rejected() {
    use overseer::host::check_path_within_project;
    assert!(check_path_within_project("src/ok.rs").is_ok());
    assert!(check_path_within_project("../../etc/shadow").is_err());
}
