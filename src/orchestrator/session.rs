//! Session body: resumption gate, kind continuations, subprocess execution
//!
//! Step 0 of every session reads the newest un-completed checkpoint. Pending
//! suspends the session; a resolved one carries a continuation that must run
//! before anything else, keyed on the checkpoint kind. Only after the gate is
//! drained does the session render a prompt and launch the AI subprocess.

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::checkpoint::final_order;
use crate::error::HarnessError;
use crate::host::with_retry;
use crate::runner::{run_streaming, CommandSpec};
use crate::spec_id::MIN_SPEC_BYTES;
use crate::store::{WorkspaceStore, APP_SPEC_FILE};
use crate::types::{
    Checkpoint, CheckpointKind, CheckpointStatus, IssueState, Milestone, Phase, Scope,
    SessionFiles, WorkspaceInfo,
};

use super::{Orchestrator, SessionEnd};

/// What a drained gate tells the rest of the session to do.
enum Continuation {
    /// Run the subprocess, optionally with feedback appended to the prompt
    Proceed(Option<String>),
    /// The session is over
    End(SessionEnd),
}

/// Outcome of the coding-to-MR transition gate check.
enum TransitionGate {
    NotNeeded,
    Waiting(Checkpoint),
    Advanced,
}

impl Orchestrator {
    pub(super) async fn run_session_inner(
        &self,
        stop_rx: watch::Receiver<bool>,
    ) -> Result<SessionEnd, HarnessError> {
        let info = self.store().workspace_info()?;
        self.store().begin_session(Utc::now())?;
        self.log(&format!(
            "session started (agent {}, auto_accept={})",
            self.config.agent_id, info.auto_accept
        ));

        let mut extra_context = None;
        let mut suppress_transition_gate = false;

        // Step 0: the resumption gate.
        if let Some(checkpoint) = self.engine.load_pending_auto(info.auto_accept)? {
            match checkpoint.status {
                CheckpointStatus::Pending => {
                    self.log(&format!(
                        "pending {} checkpoint {} awaits a verdict; suspending",
                        checkpoint.kind, checkpoint.checkpoint_id
                    ));
                    return Ok(SessionEnd::WaitingCheckpoint { checkpoint });
                }
                CheckpointStatus::Approved | CheckpointStatus::Modified => {
                    match self.apply_resolved(&info, &checkpoint)? {
                        Continuation::End(end) => return Ok(end),
                        Continuation::Proceed(ctx) => extra_context = ctx,
                    }
                }
                CheckpointStatus::Rejected => {
                    let (continuation, suppress) = self.apply_rejected(&checkpoint)?;
                    suppress_transition_gate = suppress;
                    match continuation {
                        Continuation::End(end) => return Ok(end),
                        Continuation::Proceed(ctx) => extra_context = ctx,
                    }
                }
            }
        }

        // A milestone claiming completion with no issues is contradictory
        // state; the MR phase must never run for it, so refuse here instead
        // of re-deriving a phase from it.
        if self.store().milestone_exists() {
            let milestone = self.store().milestone()?;
            if milestone.all_issues_closed && milestone.issues.is_empty() {
                let message = "milestone has no issues; refusing to run the MR phase".to_string();
                self.log(&message);
                return Ok(SessionEnd::Failed {
                    message,
                    log_tail: String::new(),
                });
            }
        }

        let mut phase = self.determine_phase()?;

        if phase == Phase::Coding && !suppress_transition_gate {
            match self.ensure_transition_gate(&info)? {
                TransitionGate::Waiting(checkpoint) => {
                    return Ok(SessionEnd::WaitingCheckpoint { checkpoint })
                }
                TransitionGate::Advanced => phase = self.determine_phase()?,
                TransitionGate::NotNeeded => {}
            }
        }

        match phase {
            Phase::Done => {
                self.log("run complete");
                return Ok(SessionEnd::Done);
            }
            Phase::Initializer => {
                let spec_len = self.store().read_bytes(APP_SPEC_FILE).map(|b| b.len() as u64)?;
                if spec_len < MIN_SPEC_BYTES {
                    return Ok(SessionEnd::Failed {
                        message: format!(
                            "spec is {spec_len} bytes, below the {MIN_SPEC_BYTES} byte minimum; refusing to initialize"
                        ),
                        log_tail: String::new(),
                    });
                }
            }
            Phase::Mr => {
                let milestone = self.store().milestone()?;
                if milestone.issues.is_empty() {
                    return Ok(SessionEnd::Failed {
                        message: "milestone has no issues; refusing to run the MR phase".into(),
                        log_tail: String::new(),
                    });
                }
            }
            Phase::Coding => {}
        }

        // Session body: one fresh AI subprocess.
        let prompt = self.prompts.render(phase, &info, extra_context.as_deref())?;
        let spec = self.agent_command(&info, phase);
        self.log(&format!("launching agent subprocess for {phase} phase"));

        let outcome = run_streaming(&spec, &prompt, &self.config.log_path, stop_rx, self.config.stop_grace).await?;

        if outcome.stopped {
            self.log("session stopped");
            return Ok(SessionEnd::Stopped);
        }
        let sentinel_hit = outcome.stderr_tail.contains(super::AGENT_FAILURE_SENTINEL);
        if !outcome.success() || sentinel_hit {
            let message = if sentinel_hit {
                "agent subprocess reported a fatal error".to_string()
            } else {
                format!(
                    "agent subprocess exited with {}",
                    outcome
                        .exit_code
                        .map_or_else(|| "signal".to_string(), |c| format!("code {c}"))
                )
            };
            self.log(&message);
            let mut log_tail = WorkspaceStore::log_tail(&self.config.log_path, 2048);
            if log_tail.is_empty() {
                log_tail = outcome.stderr_tail;
            }
            return Ok(SessionEnd::Failed { message, log_tail });
        }

        // Classify the exit. A fresh pending gate suspends unless auto-accept
        // already resolved it, in which case the next session continues from
        // the persisted verdict.
        if let Some(checkpoint) = self.engine.load_pending_auto(info.auto_accept)? {
            if checkpoint.status == CheckpointStatus::Pending {
                self.log(&format!(
                    "subprocess created {} checkpoint {}; suspending",
                    checkpoint.kind, checkpoint.checkpoint_id
                ));
                return Ok(SessionEnd::WaitingCheckpoint { checkpoint });
            }
        }

        let phase = self.determine_phase()?;
        if phase == Phase::Done {
            self.log("run complete");
            Ok(SessionEnd::Done)
        } else {
            Ok(SessionEnd::Continue { phase })
        }
    }

    fn agent_command(&self, info: &WorkspaceInfo, phase: Phase) -> CommandSpec {
        let flag = |on: bool| if on { "1" } else { "0" };
        CommandSpec::new(&self.config.agent_program)
            .args(self.config.agent_args.iter().cloned())
            .cwd(self.store().project_dir().to_owned())
            .env("OVERSEER_PROJECT_DIR", self.store().project_dir().as_str())
            .env("OVERSEER_SPEC_SLUG", &info.spec_slug)
            .env("OVERSEER_SPEC_HASH", &info.spec_hash)
            .env("OVERSEER_PHASE", phase.as_str())
            .env("OVERSEER_AGENT_ID", self.config.agent_id.to_string())
            .env("OVERSEER_FILE_ONLY", flag(info.mode_flags.file_only_mode))
            .env("OVERSEER_SKIP_PUPPETEER", flag(info.mode_flags.skip_puppeteer))
            .env("OVERSEER_SKIP_TEST_SUITE", flag(info.mode_flags.skip_test_suite))
            .env(
                "OVERSEER_SKIP_REGRESSION",
                flag(info.mode_flags.skip_regression_testing),
            )
    }

    /// Continuation for an approved or modified checkpoint. Completion is
    /// called only after the verdict's consequences have been carried out.
    fn apply_resolved(
        &self,
        info: &WorkspaceInfo,
        checkpoint: &Checkpoint,
    ) -> Result<Continuation, HarnessError> {
        self.log(&format!(
            "applying {} verdict on {} checkpoint {}",
            checkpoint.status, checkpoint.kind, checkpoint.checkpoint_id
        ));
        match checkpoint.kind {
            CheckpointKind::ProjectVerification => self.continue_project_verification(info, checkpoint),
            CheckpointKind::SpecToIssues => self.continue_spec_to_issues(checkpoint),
            CheckpointKind::IssueEnrichment => self.continue_issue_enrichment(checkpoint),
            CheckpointKind::IssueSelection => self.continue_issue_selection(checkpoint),
            CheckpointKind::IssueClosure => self.continue_issue_closure(checkpoint),
            CheckpointKind::RegressionApproval => self.continue_regression(checkpoint),
            CheckpointKind::MrPhaseTransition => {
                self.engine.complete(&checkpoint.checkpoint_id)?;
                Ok(Continuation::Proceed(None))
            }
            CheckpointKind::MrReview => self.continue_mr_review(info, checkpoint),
        }
    }

    /// Kind-specific rejection semantics. The bool suppresses re-creating
    /// the MR transition gate in the same session that saw it rejected.
    fn apply_rejected(&self, checkpoint: &Checkpoint) -> Result<(Continuation, bool), HarnessError> {
        let notes = checkpoint
            .human_notes
            .clone()
            .unwrap_or_else(|| "no reason given".to_string());
        self.log(&format!(
            "{} checkpoint {} was rejected: {notes}",
            checkpoint.kind, checkpoint.checkpoint_id
        ));

        if checkpoint.kind.rejection_halts() {
            self.engine.complete(&checkpoint.checkpoint_id)?;
            return Ok((
                Continuation::End(SessionEnd::Halted {
                    reason: format!("{} rejected: {notes}", checkpoint.kind),
                }),
                false,
            ));
        }

        match checkpoint.kind {
            CheckpointKind::IssueSelection => {
                self.engine.complete(&checkpoint.checkpoint_id)?;
                Ok((
                    Continuation::End(SessionEnd::Halted {
                        reason: format!("issue selection rejected: {notes}"),
                    }),
                    false,
                ))
            }
            CheckpointKind::IssueEnrichment => {
                self.engine.complete(&checkpoint.checkpoint_id)?;
                Ok((
                    Continuation::Proceed(Some(
                        "Enrichment was declined by the reviewer; proceed without enriching issues."
                            .to_string(),
                    )),
                    false,
                ))
            }
            // The rejected closure stays un-completed: it keeps feeding the
            // reviewer's feedback into every session until a fresh closure
            // checkpoint supersedes it and completes both.
            CheckpointKind::IssueClosure => Ok((
                Continuation::Proceed(Some(format!(
                    "Closure of issue #{} was rejected: {notes}. Address the feedback, then create a fresh closure checkpoint.",
                    checkpoint.scope
                ))),
                false,
            )),
            CheckpointKind::RegressionApproval => {
                self.engine.complete(&checkpoint.checkpoint_id)?;
                Ok((
                    Continuation::Proceed(Some(
                        "The regression report was rejected; continue with planned work.".to_string(),
                    )),
                    false,
                ))
            }
            CheckpointKind::MrPhaseTransition => {
                self.engine.complete(&checkpoint.checkpoint_id)?;
                Ok((
                    Continuation::Proceed(Some(
                        "The move to MR creation was declined; keep working on the milestone.".to_string(),
                    )),
                    true,
                ))
            }
            // rejection_halts covered these above
            CheckpointKind::ProjectVerification
            | CheckpointKind::SpecToIssues
            | CheckpointKind::MrReview => unreachable!("halting kinds handled earlier"),
        }
    }

    fn continue_project_verification(
        &self,
        info: &WorkspaceInfo,
        checkpoint: &Checkpoint,
    ) -> Result<Continuation, HarnessError> {
        let title = checkpoint
            .modifications
            .as_ref()
            .and_then(|m| m.get("title"))
            .or_else(|| checkpoint.context.get("proposed_title"))
            .and_then(Value::as_str)
            .map_or_else(|| format!("Milestone for {}", info.spec_slug), str::to_string);
        let description = checkpoint
            .context
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let milestone_ref = with_retry(self.config.retry, "create_milestone", || {
            self.host.create_milestone(&title, &description)
        })?;
        with_retry(self.config.retry, "create_branch", || {
            self.host.create_branch(&info.feature_branch, &info.target_branch)
        })?;

        let now = Utc::now();
        let milestone = Milestone {
            repository: self.host.repository().to_string(),
            milestone_id: milestone_ref.id,
            milestone_title: title.clone(),
            feature_branch: info.feature_branch.clone(),
            issues: Vec::new(),
            all_issues_closed: false,
            completed_at: None,
            merge_request_iid: None,
            merge_request_url: None,
            session_files: SessionFiles::fresh(now),
        };
        self.store().write_milestone(&milestone)?;
        self.engine.complete(&checkpoint.checkpoint_id)?;
        self.log(&format!("milestone '{title}' created (id {})", milestone_ref.id));
        Ok(Continuation::Proceed(Some(format!(
            "Milestone '{title}' and branch {} exist; propose the issue breakdown next.",
            info.feature_branch
        ))))
    }

    fn continue_spec_to_issues(&self, checkpoint: &Checkpoint) -> Result<Continuation, HarnessError> {
        let proposed = checkpoint
            .modifications
            .as_ref()
            .and_then(|m| m.get("issues"))
            .or_else(|| checkpoint.context.get("issues"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut milestone = self.store().milestone()?;
        let mut created = Vec::with_capacity(proposed.len());
        for item in &proposed {
            let title = item.get("title").and_then(Value::as_str).unwrap_or("untitled");
            let description = item.get("description").and_then(Value::as_str).unwrap_or_default();
            let mut labels: Vec<String> = item
                .get("labels")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            if let Some(priority) = item.get("priority").and_then(Value::as_str) {
                labels.push(format!("priority-{priority}"));
            }

            let issue = with_retry(self.config.retry, "create_issue", || {
                self.host.create_issue(milestone.milestone_id, title, description, &labels)
            })?;
            created.push(issue);
        }

        let count = created.len();
        milestone.issues = created;
        milestone.refresh_closed_flag(Utc::now());
        self.store().write_milestone(&milestone)?;
        self.engine.complete(&checkpoint.checkpoint_id)?;
        self.log(&format!("created {count} issues from the approved breakdown"));
        Ok(Continuation::Proceed(Some(format!(
            "{count} issues now exist; judge them for enrichment next."
        ))))
    }

    fn continue_issue_enrichment(&self, checkpoint: &Checkpoint) -> Result<Continuation, HarnessError> {
        let order = final_order(checkpoint, "enrichment_order", "recommended_enrichment_order");
        self.engine.complete(&checkpoint.checkpoint_id)?;
        let context = if order.is_empty() {
            "No issues were selected for enrichment; begin coding work.".to_string()
        } else {
            format!(
                "Enrich issues in this order before coding: {}.",
                order.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
            )
        };
        Ok(Continuation::Proceed(Some(context)))
    }

    fn continue_issue_selection(&self, checkpoint: &Checkpoint) -> Result<Continuation, HarnessError> {
        let order = final_order(checkpoint, "issue_order", "recommended_issue_order");
        let mut milestone = self.store().milestone()?;

        let claimed = order
            .iter()
            .find(|iid| milestone.issue(**iid).is_some_and(|i| i.state != IssueState::Closed))
            .copied();
        let Some(iid) = claimed else {
            self.engine.complete(&checkpoint.checkpoint_id)?;
            return Ok(Continuation::End(SessionEnd::Failed {
                message: "approved issue selection contains no open issue".into(),
                log_tail: String::new(),
            }));
        };

        with_retry(self.config.retry, "update_issue", || {
            self.host.update_issue(iid, IssueState::InProgress, None)
        })?;
        if let Some(issue) = milestone.issue_mut(iid) {
            issue.state = IssueState::InProgress;
        }
        self.store().write_milestone(&milestone)?;
        self.engine.complete(&checkpoint.checkpoint_id)?;
        self.log(&format!("claimed issue #{iid}"));
        Ok(Continuation::Proceed(Some(format!(
            "You have claimed issue #{iid}; implement it in this session."
        ))))
    }

    fn continue_issue_closure(&self, checkpoint: &Checkpoint) -> Result<Continuation, HarnessError> {
        let Scope::Issue(iid) = checkpoint.scope else {
            return Ok(Continuation::End(SessionEnd::Failed {
                message: "issue_closure checkpoint has no issue scope".into(),
                log_tail: String::new(),
            }));
        };

        with_retry(self.config.retry, "update_issue", || {
            self.host.update_issue(iid, IssueState::Closed, None)
        })?;
        let mut milestone = self.store().milestone()?;
        if let Some(issue) = milestone.issue_mut(iid) {
            issue.state = IssueState::Closed;
        }
        milestone.refresh_closed_flag(Utc::now());
        self.store().write_milestone(&milestone)?;

        // Superseded rejections complete first, in creation order, then the
        // approved closure itself.
        for rejected in self
            .engine
            .unresolved_rejections(CheckpointKind::IssueClosure, &checkpoint.scope)?
        {
            if rejected.checkpoint_id != checkpoint.checkpoint_id {
                self.engine.complete(&rejected.checkpoint_id)?;
            }
        }
        self.engine.complete(&checkpoint.checkpoint_id)?;
        self.log(&format!("issue #{iid} closed"));
        Ok(Continuation::Proceed(Some(format!(
            "Issue #{iid} is closed; select the next issue or finish the milestone."
        ))))
    }

    fn continue_regression(&self, checkpoint: &Checkpoint) -> Result<Continuation, HarnessError> {
        let iid = checkpoint
            .context
            .get("regressed_issue")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        let decision = checkpoint
            .modifications
            .as_ref()
            .and_then(|m| m.get("human_decision"))
            .and_then(Value::as_str)
            .unwrap_or("fix_now")
            .to_string();

        let context = match decision.as_str() {
            "defer" => {
                let mut milestone = self.store().milestone()?;
                let title = format!("Regression in issue #{iid}");
                let description = format!(
                    "Deferred regression observed in previously closed issue #{iid}; see the regression checkpoint for evidence."
                );
                let labels = vec!["bug".to_string(), "regression".to_string()];
                let issue = with_retry(self.config.retry, "create_issue", || {
                    self.host
                        .create_issue(milestone.milestone_id, &title, &description, &labels)
                })?;
                let new_iid = issue.iid;
                milestone.issues.push(issue);
                milestone.refresh_closed_flag(Utc::now());
                self.store().write_milestone(&milestone)?;
                self.log(&format!("regression deferred; created tracking issue #{new_iid}"));
                format!("Regression in #{iid} deferred to new issue #{new_iid}; continue planned work.")
            }
            "rollback" => format!("Roll back the change that regressed issue #{iid} before continuing."),
            "false_positive" => {
                format!("The regression flagged for issue #{iid} was judged a false positive; continue.")
            }
            _ => format!("Fix the regression in issue #{iid} now, before any other work."),
        };

        self.engine.complete(&checkpoint.checkpoint_id)?;
        Ok(Continuation::Proceed(Some(context)))
    }

    fn continue_mr_review(
        &self,
        info: &WorkspaceInfo,
        checkpoint: &Checkpoint,
    ) -> Result<Continuation, HarnessError> {
        let overridden = |key: &str| {
            checkpoint
                .modifications
                .as_ref()
                .and_then(|m| m.get(key))
                .or_else(|| checkpoint.context.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let mut milestone = self.store().milestone()?;
        let title = overridden("title").unwrap_or_else(|| milestone.milestone_title.clone());
        let description = overridden("description").unwrap_or_default();

        let mr = with_retry(self.config.retry, "create_merge_request", || {
            self.host
                .create_merge_request(&info.feature_branch, &info.target_branch, &title, &description)
        })?;

        // The phase only advances once the MR is verified to exist.
        let verified = with_retry(self.config.retry, "get_merge_request", || {
            self.host.get_merge_request(mr.iid)
        })?;
        if verified.is_none() {
            return Ok(Continuation::End(SessionEnd::Failed {
                message: format!("merge request !{} was created but cannot be found on the host", mr.iid),
                log_tail: String::new(),
            }));
        }

        milestone.merge_request_iid = Some(mr.iid);
        milestone.merge_request_url = Some(mr.url.clone());
        self.store().write_milestone(&milestone)?;
        self.engine.complete(&checkpoint.checkpoint_id)?;
        self.log(&format!("merge request !{} created: {}", mr.iid, mr.url));
        Ok(Continuation::Proceed(None))
    }

    /// Create the coding-to-MR gate once every issue is closed. With
    /// auto-accept the gate resolves and completes inline so the session can
    /// continue straight into the MR phase.
    fn ensure_transition_gate(&self, info: &WorkspaceInfo) -> Result<TransitionGate, HarnessError> {
        if info.mode_flags.skip_mr_creation || !self.store().milestone_exists() {
            return Ok(TransitionGate::NotNeeded);
        }
        let milestone = self.store().milestone()?;
        if !milestone.all_issues_closed {
            return Ok(TransitionGate::NotNeeded);
        }
        if let Some(latest) = self.engine.latest_of_kind(CheckpointKind::MrPhaseTransition)? {
            if !latest.completed {
                // Step 0 drains un-completed gates; reaching here means the
                // log changed under us, so let the next session sort it out.
                return Ok(TransitionGate::NotNeeded);
            }
        }

        let context = json!({
            "milestone_title": milestone.milestone_title,
            "issues_closed": milestone.issues.len(),
        });
        let id = self
            .engine
            .create(CheckpointKind::MrPhaseTransition, Scope::Global, context)?;
        self.log(&format!("all issues closed; created mr_phase_transition checkpoint {id}"));

        if info.auto_accept {
            self.engine.load_pending_auto(true)?;
            self.engine.complete(&id)?;
            return Ok(TransitionGate::Advanced);
        }

        let checkpoint = self.engine.log()?.find(&id).cloned().ok_or_else(|| {
            crate::error::CheckpointError::Missing {
                checkpoint_id: id.clone(),
            }
        })?;
        Ok(TransitionGate::Waiting(checkpoint))
    }

    pub(super) fn log(&self, line: &str) {
        let _ = WorkspaceStore::append_log(&self.config.log_path, line);
    }
}
