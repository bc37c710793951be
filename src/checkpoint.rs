//! Checkpoint protocol (C2)
//!
//! The decision-gate log is the only way an agent can seek human judgment,
//! and it is a hard synchronization barrier. The engine owns the gate
//! semantics:
//!
//! * at most one pending un-completed checkpoint per scope;
//! * `pending -> {approved, modified, rejected}` exactly once, then
//!   `completed = true` exactly once, never back;
//! * `completed` means "the agent acted on the verdict", which is a later
//!   moment than "the human decided";
//! * terminal gates (`issue_closure`, `mr_review`) may only be created after
//!   the session's quality checks were recorded as passing.
//!
//! Writes are load-modify-replace over the atomic store, so concurrent
//! resolvers race on the freshly re-read `status` field: the loser observes a
//! non-pending checkpoint and fails.

use chrono::Utc;
use serde_json::Value;

use crate::error::CheckpointError;
use crate::store::WorkspaceStore;
use crate::types::{Checkpoint, CheckpointKind, CheckpointLog, CheckpointStatus, Scope, Verdict};

/// Proposed-issue count above which the spec_to_issues context is flagged for
/// the reviewer rather than rejected.
pub const ISSUE_BUDGET: usize = 12;

/// Valid values for `modifications.human_decision` on a regression gate.
pub const REGRESSION_DECISIONS: [&str; 4] = ["fix_now", "defer", "rollback", "false_positive"];

/// Gate engine bound to one run's workspace.
#[derive(Debug, Clone)]
pub struct CheckpointEngine {
    store: WorkspaceStore,
}

impl CheckpointEngine {
    #[must_use]
    pub fn new(store: WorkspaceStore) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &WorkspaceStore {
        &self.store
    }

    /// Load the full log (missing file reads as empty).
    pub fn log(&self) -> Result<CheckpointLog, CheckpointError> {
        Ok(self.store.checkpoint_log()?)
    }

    /// Append a new pending checkpoint under `scope` and return its id.
    ///
    /// Fails when the scope already has a pending un-completed checkpoint, or
    /// when a terminal kind is created without a passing quality report.
    pub fn create(
        &self,
        kind: CheckpointKind,
        scope: Scope,
        mut context: Value,
    ) -> Result<String, CheckpointError> {
        if kind.requires_verification() {
            self.check_verification(kind)?;
        }

        let mut log = self.log()?;
        let key = scope.key();
        if let Some(existing) = log
            .scopes
            .get(&key)
            .into_iter()
            .flatten()
            .find(|c| c.status == CheckpointStatus::Pending && !c.completed)
        {
            return Err(CheckpointError::DuplicatePending {
                scope: key,
                existing: existing.checkpoint_id.clone(),
            });
        }

        if kind == CheckpointKind::SpecToIssues {
            flag_issue_budget(&mut context);
        }

        let created_at = Utc::now();
        let checkpoint_id = generate_id(kind, &scope, created_at, log.iter().count());
        let checkpoint = Checkpoint {
            checkpoint_id: checkpoint_id.clone(),
            kind,
            scope,
            context,
            created_at,
            status: CheckpointStatus::Pending,
            modifications: None,
            human_notes: None,
            resolved_at: None,
            completed: false,
            completed_at: None,
        };

        log.scopes.entry(key).or_default().push(checkpoint);
        self.store.write_checkpoint_log(&log)?;
        Ok(checkpoint_id)
    }

    /// The newest un-completed checkpoint, optionally restricted to a scope.
    ///
    /// A resolved-but-uncompleted checkpoint is still returned: it carries
    /// the continuation the next session must run before anything else.
    pub fn load_pending(&self, scope: Option<&Scope>) -> Result<Option<Checkpoint>, CheckpointError> {
        let log = self.log()?;
        let mut newest: Option<&Checkpoint> = None;
        for checkpoint in log.iter() {
            if checkpoint.completed {
                continue;
            }
            if let Some(scope) = scope {
                if checkpoint.scope != *scope {
                    continue;
                }
            }
            let is_newer = newest.map_or(true, |n| checkpoint.created_at >= n.created_at);
            if is_newer {
                newest = Some(checkpoint);
            }
        }
        Ok(newest.cloned())
    }

    /// Like [`load_pending`](Self::load_pending), but when `auto_accept` is
    /// set a still-pending checkpoint is resolved to its kind's auto-verdict
    /// first. The auto-resolution is persisted so the audit trail and the
    /// completion step work exactly as with a human verdict.
    pub fn load_pending_auto(&self, auto_accept: bool) -> Result<Option<Checkpoint>, CheckpointError> {
        let Some(checkpoint) = self.load_pending(None)? else {
            return Ok(None);
        };
        if !auto_accept || checkpoint.status != CheckpointStatus::Pending {
            return Ok(Some(checkpoint));
        }

        let (modifications, notes) = auto_verdict(checkpoint.kind, &checkpoint.context);
        let mut log = self.log()?;
        let entry = log
            .find_mut(&checkpoint.checkpoint_id)
            .ok_or_else(|| CheckpointError::Missing {
                checkpoint_id: checkpoint.checkpoint_id.clone(),
            })?;
        if entry.status != CheckpointStatus::Pending {
            // Lost a race with a human resolver; their verdict wins.
            return Ok(Some(entry.clone()));
        }
        entry.status = CheckpointStatus::Approved;
        entry.modifications = modifications;
        entry.human_notes = Some(notes);
        entry.resolved_at = Some(Utc::now());
        let resolved = entry.clone();
        self.store.write_checkpoint_log(&log)?;
        Ok(Some(resolved))
    }

    /// Most recent checkpoint of `kind`, regardless of status.
    pub fn latest_of_kind(&self, kind: CheckpointKind) -> Result<Option<Checkpoint>, CheckpointError> {
        let log = self.log()?;
        let mut newest: Option<&Checkpoint> = None;
        for checkpoint in log.iter().filter(|c| c.kind == kind) {
            let is_newer = newest.map_or(true, |n| checkpoint.created_at >= n.created_at);
            if is_newer {
                newest = Some(checkpoint);
            }
        }
        Ok(newest.cloned())
    }

    /// True when the latest checkpoint of `kind` is approved and acted on.
    /// Used to gate phase transitions.
    pub fn kind_approved_and_completed(&self, kind: CheckpointKind) -> Result<bool, CheckpointError> {
        Ok(self.latest_of_kind(kind)?.is_some_and(|c| {
            matches!(c.status, CheckpointStatus::Approved | CheckpointStatus::Modified) && c.completed
        }))
    }

    /// Record a human verdict on a pending checkpoint.
    ///
    /// The status check doubles as the optimistic concurrency guard: the log
    /// is re-read here, so a second resolver observes the first one's
    /// non-pending status and fails.
    pub fn resolve(
        &self,
        checkpoint_id: &str,
        verdict: Verdict,
        modifications: Option<Value>,
        human_notes: Option<String>,
    ) -> Result<Checkpoint, CheckpointError> {
        let mut log = self.log()?;
        let entry = log.find_mut(checkpoint_id).ok_or_else(|| CheckpointError::Missing {
            checkpoint_id: checkpoint_id.to_string(),
        })?;

        if entry.status != CheckpointStatus::Pending {
            return Err(CheckpointError::AlreadyResolved {
                checkpoint_id: checkpoint_id.to_string(),
                status: entry.status.as_str().to_string(),
            });
        }

        validate_resolution(entry.kind, verdict, modifications.as_ref())?;

        entry.status = verdict.into_status();
        entry.modifications = modifications;
        entry.human_notes = human_notes;
        entry.resolved_at = Some(Utc::now());
        let resolved = entry.clone();
        self.store.write_checkpoint_log(&log)?;
        Ok(resolved)
    }

    /// Mark a resolved checkpoint as acted-on.
    pub fn complete(&self, checkpoint_id: &str) -> Result<Checkpoint, CheckpointError> {
        let mut log = self.log()?;
        let entry = log.find_mut(checkpoint_id).ok_or_else(|| CheckpointError::Missing {
            checkpoint_id: checkpoint_id.to_string(),
        })?;

        if entry.status == CheckpointStatus::Pending {
            return Err(CheckpointError::StillPending {
                checkpoint_id: checkpoint_id.to_string(),
            });
        }
        if entry.completed {
            return Err(CheckpointError::AlreadyCompleted {
                checkpoint_id: checkpoint_id.to_string(),
            });
        }

        entry.completed = true;
        entry.completed_at = Some(Utc::now());
        let completed = entry.clone();
        self.store.write_checkpoint_log(&log)?;
        Ok(completed)
    }

    /// Un-completed rejected checkpoints of `kind` in `scope`, oldest first.
    ///
    /// A fresh closure gate supersedes a rejected one; when the fresh gate is
    /// approved and acted on, the superseded rejections are completed first,
    /// in creation order.
    pub fn unresolved_rejections(
        &self,
        kind: CheckpointKind,
        scope: &Scope,
    ) -> Result<Vec<Checkpoint>, CheckpointError> {
        let log = self.log()?;
        let mut rejected: Vec<Checkpoint> = log
            .iter()
            .filter(|c| {
                c.kind == kind && c.scope == *scope && c.status == CheckpointStatus::Rejected && !c.completed
            })
            .cloned()
            .collect();
        rejected.sort_by_key(|c| c.created_at);
        Ok(rejected)
    }

    fn check_verification(&self, kind: CheckpointKind) -> Result<(), CheckpointError> {
        let report = self
            .store
            .quality_report()?
            .ok_or_else(|| CheckpointError::VerificationMissing {
                kind: kind.as_str().to_string(),
            })?;
        if !report.all_passing() {
            let mut failing = Vec::new();
            for (name, outcome) in [
                ("lint", report.lint),
                ("format", report.format),
                ("types", report.types),
                ("tests", report.tests),
            ] {
                if !outcome.is_acceptable() {
                    failing.push(name);
                }
            }
            if report.browser.is_some_and(|b| !b.is_acceptable()) {
                failing.push("browser");
            }
            return Err(CheckpointError::VerificationFailed {
                kind: kind.as_str().to_string(),
                detail: failing.join(", "),
            });
        }
        Ok(())
    }
}

/// Kind-specific validation of a human verdict.
///
/// Regression gates are the one place a non-`modified` verdict carries
/// modifications: the decision is part of the approval itself.
fn validate_resolution(
    kind: CheckpointKind,
    verdict: Verdict,
    modifications: Option<&Value>,
) -> Result<(), CheckpointError> {
    if kind == CheckpointKind::RegressionApproval && verdict != Verdict::Rejected {
        let decision = modifications
            .and_then(|m| m.get("human_decision"))
            .and_then(Value::as_str);
        match decision {
            Some(d) if REGRESSION_DECISIONS.contains(&d) => return Ok(()),
            _ => {
                return Err(CheckpointError::MissingDecision {
                    kind: kind.as_str().to_string(),
                })
            }
        }
    }

    if modifications.is_some() && verdict != Verdict::Modified {
        return Err(CheckpointError::ModificationsNotAllowed);
    }
    Ok(())
}

/// Default resolution applied when `auto_accept` is on.
#[must_use]
pub fn auto_verdict(kind: CheckpointKind, context: &Value) -> (Option<Value>, String) {
    match kind {
        CheckpointKind::IssueEnrichment => {
            let order = context
                .get("recommended_enrichment_order")
                .cloned()
                .unwrap_or_else(|| Value::Array(vec![]));
            (
                Some(serde_json::json!({ "enrichment_order": order })),
                "Auto-approved with recommended enrichment order".to_string(),
            )
        }
        CheckpointKind::IssueSelection => {
            let order = context
                .get("recommended_issue_order")
                .cloned()
                .unwrap_or_else(|| Value::Array(vec![]));
            (
                Some(serde_json::json!({ "issue_order": order })),
                "Auto-approved with recommended issue order".to_string(),
            )
        }
        CheckpointKind::RegressionApproval => (
            Some(serde_json::json!({ "human_decision": "fix_now" })),
            "Auto-approved with fix_now".to_string(),
        ),
        _ => (None, "Auto-approved".to_string()),
    }
}

/// The issue order a resolved selection/enrichment checkpoint settles on:
/// the human override when present, otherwise the recommended order.
#[must_use]
pub fn final_order(checkpoint: &Checkpoint, modifications_key: &str, context_key: &str) -> Vec<u64> {
    let from = |value: Option<&Value>| -> Option<Vec<u64>> {
        value
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_u64).collect())
    };
    from(checkpoint.modifications.as_ref().and_then(|m| m.get(modifications_key)))
        .or_else(|| from(checkpoint.context.get(context_key)))
        .unwrap_or_default()
}

fn flag_issue_budget(context: &mut Value) {
    let count = context
        .get("issues")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    if count > ISSUE_BUDGET {
        if let Some(map) = context.as_object_mut() {
            map.insert("over_budget".to_string(), Value::Bool(true));
            map.insert(
                "over_budget_note".to_string(),
                Value::String(format!(
                    "{count} proposed issues exceed the budget of {ISSUE_BUDGET} — explain before approving"
                )),
            );
        }
    }
}

fn generate_id(
    kind: CheckpointKind,
    scope: &Scope,
    created_at: chrono::DateTime<Utc>,
    sequence: usize,
) -> String {
    let seed = format!(
        "{}:{}:{}:{}:{}",
        kind.as_str(),
        scope.key(),
        created_at.timestamp_nanos_opt().unwrap_or_default(),
        sequence,
        std::process::id()
    );
    let digest = blake3::hash(seed.as_bytes());
    format!("ck-{}", &digest.to_hex()[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CheckOutcome, QualityReport};
    use camino::Utf8PathBuf;
    use serde_json::json;

    fn engine(td: &tempfile::TempDir) -> CheckpointEngine {
        let project = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        CheckpointEngine::new(WorkspaceStore::open(&project, "todo-app", "abcde"))
    }

    fn passing_report() -> QualityReport {
        QualityReport {
            lint: CheckOutcome::Pass,
            format: CheckOutcome::Pass,
            types: CheckOutcome::Pass,
            tests: CheckOutcome::Pass,
            browser: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn create_then_duplicate_pending_fails() {
        let td = tempfile::TempDir::new().unwrap();
        let engine = engine(&td);

        let id = engine
            .create(CheckpointKind::ProjectVerification, Scope::Global, json!({}))
            .unwrap();
        let err = engine
            .create(CheckpointKind::SpecToIssues, Scope::Global, json!({}))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::DuplicatePending { .. }));

        // A different scope is unaffected.
        engine
            .create(CheckpointKind::RegressionApproval, Scope::Issue(1), json!({}))
            .unwrap();
        let _ = id;
    }

    #[test]
    fn resolve_and_complete_happy_path() {
        let td = tempfile::TempDir::new().unwrap();
        let engine = engine(&td);
        let id = engine
            .create(CheckpointKind::ProjectVerification, Scope::Global, json!({}))
            .unwrap();

        let resolved = engine
            .resolve(&id, Verdict::Approved, None, Some("looks right".into()))
            .unwrap();
        assert_eq!(resolved.status, CheckpointStatus::Approved);
        assert!(!resolved.completed);

        let completed = engine.complete(&id).unwrap();
        assert!(completed.completed);
        assert!(completed.completed_at.is_some());
    }

    #[test]
    fn second_resolver_observes_first_verdict() {
        let td = tempfile::TempDir::new().unwrap();
        let engine = engine(&td);
        let id = engine
            .create(CheckpointKind::MrPhaseTransition, Scope::Global, json!({}))
            .unwrap();

        engine.resolve(&id, Verdict::Approved, None, None).unwrap();
        let err = engine
            .resolve(&id, Verdict::Rejected, None, Some("no".into()))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::AlreadyResolved { .. }));
    }

    #[test]
    fn complete_requires_resolution_and_is_single_shot() {
        let td = tempfile::TempDir::new().unwrap();
        let engine = engine(&td);
        let id = engine
            .create(CheckpointKind::MrPhaseTransition, Scope::Global, json!({}))
            .unwrap();

        assert!(matches!(
            engine.complete(&id).unwrap_err(),
            CheckpointError::StillPending { .. }
        ));
        engine.resolve(&id, Verdict::Approved, None, None).unwrap();
        engine.complete(&id).unwrap();
        assert!(matches!(
            engine.complete(&id).unwrap_err(),
            CheckpointError::AlreadyCompleted { .. }
        ));
    }

    #[test]
    fn modifications_require_modified_verdict() {
        let td = tempfile::TempDir::new().unwrap();
        let engine = engine(&td);
        let id = engine
            .create(CheckpointKind::SpecToIssues, Scope::Global, json!({"issues": []}))
            .unwrap();

        let err = engine
            .resolve(&id, Verdict::Approved, Some(json!({"issues": []})), None)
            .unwrap_err();
        assert!(matches!(err, CheckpointError::ModificationsNotAllowed));
    }

    #[test]
    fn regression_approval_needs_a_decision() {
        let td = tempfile::TempDir::new().unwrap();
        let engine = engine(&td);
        let id = engine
            .create(
                CheckpointKind::RegressionApproval,
                Scope::Global,
                json!({"regressed_issue": 7}),
            )
            .unwrap();

        let err = engine.resolve(&id, Verdict::Approved, None, None).unwrap_err();
        assert!(matches!(err, CheckpointError::MissingDecision { .. }));

        let resolved = engine
            .resolve(
                &id,
                Verdict::Approved,
                Some(json!({"human_decision": "defer"})),
                None,
            )
            .unwrap();
        assert_eq!(
            resolved.modifications.unwrap()["human_decision"],
            json!("defer")
        );
    }

    #[test]
    fn auto_accept_resolves_with_kind_defaults_and_persists() {
        let td = tempfile::TempDir::new().unwrap();
        let engine = engine(&td);
        engine
            .create(
                CheckpointKind::IssueEnrichment,
                Scope::Global,
                json!({"recommended_enrichment_order": [2, 1, 3]}),
            )
            .unwrap();

        let resolved = engine.load_pending_auto(true).unwrap().unwrap();
        assert_eq!(resolved.status, CheckpointStatus::Approved);
        assert_eq!(
            resolved.modifications.as_ref().unwrap()["enrichment_order"],
            json!([2, 1, 3])
        );

        // Persisted: a later read without auto-accept sees the resolution.
        let again = engine.load_pending(None).unwrap().unwrap();
        assert_eq!(again.status, CheckpointStatus::Approved);
    }

    #[test]
    fn terminal_kinds_are_gated_on_quality() {
        let td = tempfile::TempDir::new().unwrap();
        let engine = engine(&td);

        let err = engine
            .create(CheckpointKind::IssueClosure, Scope::Issue(1), json!({}))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::VerificationMissing { .. }));

        let mut failing = passing_report();
        failing.tests = CheckOutcome::Fail;
        engine.store().write_quality_report(&failing).unwrap();
        let err = engine
            .create(CheckpointKind::IssueClosure, Scope::Issue(1), json!({}))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::VerificationFailed { .. }));

        engine.store().write_quality_report(&passing_report()).unwrap();
        engine
            .create(CheckpointKind::IssueClosure, Scope::Issue(1), json!({}))
            .unwrap();
    }

    #[test]
    fn over_budget_issue_lists_are_flagged_not_rejected() {
        let td = tempfile::TempDir::new().unwrap();
        let engine = engine(&td);
        let issues: Vec<_> = (0..15).map(|i| json!({"title": format!("issue {i}")})).collect();
        let id = engine
            .create(CheckpointKind::SpecToIssues, Scope::Global, json!({"issues": issues}))
            .unwrap();

        let checkpoint = engine.log().unwrap().find(&id).cloned().unwrap();
        assert_eq!(checkpoint.context["over_budget"], json!(true));
    }

    #[test]
    fn rejected_closures_stay_open_until_superseded() {
        let td = tempfile::TempDir::new().unwrap();
        let engine = engine(&td);
        engine.store().write_quality_report(&passing_report()).unwrap();

        let first = engine
            .create(CheckpointKind::IssueClosure, Scope::Issue(1), json!({}))
            .unwrap();
        engine
            .resolve(
                &first,
                Verdict::Rejected,
                None,
                Some("missing test for empty input".into()),
            )
            .unwrap();

        // Rejection is not pending, so a fresh closure gate is allowed.
        let second = engine
            .create(CheckpointKind::IssueClosure, Scope::Issue(1), json!({}))
            .unwrap();

        let open = engine
            .unresolved_rejections(CheckpointKind::IssueClosure, &Scope::Issue(1))
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].checkpoint_id, first);
        assert_ne!(first, second);
    }
}
