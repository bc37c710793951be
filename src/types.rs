//! Core data model for the harness
//!
//! Everything in this module is persisted as JSON through the workspace store
//! or the daemon registry, so the serde shapes here are the on-disk schema.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Coarse position in an agent's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializer,
    Coding,
    Mr,
    Done,
}

impl Phase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initializer => "initializer",
            Self::Coding => "coding",
            Self::Mr => "mr",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Daemon-visible lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    WaitingCheckpoint,
    Stopped,
    Failed,
    Done,
}

impl AgentStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::WaitingCheckpoint => "waiting_checkpoint",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Done => "done",
        }
    }

    /// Terminal states have no live session process behind them.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Done)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The eight decision gates an agent can suspend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    ProjectVerification,
    SpecToIssues,
    IssueEnrichment,
    IssueSelection,
    IssueClosure,
    RegressionApproval,
    MrPhaseTransition,
    MrReview,
}

impl CheckpointKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectVerification => "project_verification",
            Self::SpecToIssues => "spec_to_issues",
            Self::IssueEnrichment => "issue_enrichment",
            Self::IssueSelection => "issue_selection",
            Self::IssueClosure => "issue_closure",
            Self::RegressionApproval => "regression_approval",
            Self::MrPhaseTransition => "mr_phase_transition",
            Self::MrReview => "mr_review",
        }
    }

    /// Terminal gates may only be created after the session's quality checks
    /// have been recorded as passing.
    #[must_use]
    pub const fn requires_verification(&self) -> bool {
        matches!(self, Self::IssueClosure | Self::MrReview)
    }

    /// Rejecting these gates halts the agent instead of continuing.
    #[must_use]
    pub const fn rejection_halts(&self) -> bool {
        matches!(
            self,
            Self::ProjectVerification | Self::SpecToIssues | Self::MrReview
        )
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project_verification" => Ok(Self::ProjectVerification),
            "spec_to_issues" => Ok(Self::SpecToIssues),
            "issue_enrichment" => Ok(Self::IssueEnrichment),
            "issue_selection" => Ok(Self::IssueSelection),
            "issue_closure" => Ok(Self::IssueClosure),
            "regression_approval" => Ok(Self::RegressionApproval),
            "mr_phase_transition" => Ok(Self::MrPhaseTransition),
            "mr_review" => Ok(Self::MrReview),
            other => Err(format!("unknown checkpoint kind: {other}")),
        }
    }
}

/// Status of a checkpoint in the decision log.
///
/// `pending` is the only state a checkpoint is born in; the human moves it to
/// one of the other three exactly once. Completion is tracked separately on
/// [`Checkpoint::completed`] because "human decided" and "agent acted on the
/// decision" are different moments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Approved,
    Modified,
    Rejected,
}

impl CheckpointStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Modified => "modified",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A human verdict on a pending checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Modified,
    Rejected,
}

impl Verdict {
    #[must_use]
    pub const fn into_status(self) -> CheckpointStatus {
        match self {
            Self::Approved => CheckpointStatus::Approved,
            Self::Modified => CheckpointStatus::Modified,
            Self::Rejected => CheckpointStatus::Rejected,
        }
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "modified" => Ok(Self::Modified),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown verdict: {other}")),
        }
    }
}

/// The key under which a checkpoint lives in the log: the whole run, or one
/// issue. Serialized as the literal string `"global"` or the iid in decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    Global,
    Issue(u64),
}

impl Scope {
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::Issue(iid) => iid.to_string(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(Self::Global);
        }
        s.parse::<u64>()
            .map(Self::Issue)
            .map_err(|_| format!("scope must be \"global\" or an issue iid, got: {s}"))
    }
}

impl Serialize for Scope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key())
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A durable record of a pending or resolved decision gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Opaque unique identifier
    pub checkpoint_id: String,
    pub kind: CheckpointKind,
    pub scope: Scope,
    /// Kind-specific payload the client needs to render the decision
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: CheckpointStatus,
    /// Kind-specific structured override, present when `status = modified`
    /// (or when an auto-verdict carries a default order/decision)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modifications: Option<serde_json::Value>,
    /// Free text from the approver
    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Set only after the agent has acted on the resolved verdict
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// An un-completed checkpoint still gates the next session, whatever its
    /// status: pending blocks, resolved ones carry a continuation.
    #[must_use]
    pub const fn is_unresolved_gate(&self) -> bool {
        !self.completed
    }
}

/// The whole decision-gate log: scope key to append-ordered checkpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointLog {
    pub scopes: BTreeMap<String, Vec<Checkpoint>>,
}

impl CheckpointLog {
    /// Iterate every checkpoint across all scopes.
    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.scopes.values().flatten()
    }

    /// Find a checkpoint by id.
    #[must_use]
    pub fn find(&self, checkpoint_id: &str) -> Option<&Checkpoint> {
        self.iter().find(|c| c.checkpoint_id == checkpoint_id)
    }

    /// Mutable lookup by id.
    pub fn find_mut(&mut self, checkpoint_id: &str) -> Option<&mut Checkpoint> {
        self.scopes
            .values_mut()
            .flatten()
            .find(|c| c.checkpoint_id == checkpoint_id)
    }
}

/// Boolean toggles that scope out optional machinery for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeFlags {
    /// Track issues in local JSON instead of an external host
    #[serde(default)]
    pub file_only_mode: bool,
    /// End the run after the coding loop without creating an MR
    #[serde(default)]
    pub skip_mr_creation: bool,
    /// Skip browser-automation verification
    #[serde(default)]
    pub skip_puppeteer: bool,
    /// Skip the test-suite quality check
    #[serde(default)]
    pub skip_test_suite: bool,
    /// Skip regression sweeps over closed issues
    #[serde(default)]
    pub skip_regression_testing: bool,
}

/// Per-run configuration, written once at bootstrap and re-read by every
/// session. `auto_accept` is the only field a client is expected to flip
/// between sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub spec_slug: String,
    pub spec_hash: String,
    pub feature_branch: String,
    pub target_branch: String,
    pub auto_accept: bool,
    #[serde(default)]
    pub mode_flags: ModeFlags,
}

/// State tag of an issue as observed by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Open,
    InProgress,
    Closed,
}

/// A unit of implementation work within the milestone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub iid: u64,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub state: IssueState,
    /// Metadata attached by the initializer's enrichment pass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<serde_json::Value>,
}

/// Per-session record of files the current subprocess has modified.
///
/// Only paths listed here may be pushed to the external code host; the record
/// is reset at the start of every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFiles {
    pub tracked: Vec<String>,
    pub session_started: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl SessionFiles {
    #[must_use]
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            tracked: Vec::new(),
            session_started: now,
            last_updated: now,
        }
    }
}

/// The unit of grouped work for one run. Created once by the initializer,
/// mutated by every later phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub repository: String,
    pub milestone_id: u64,
    pub milestone_title: String,
    pub feature_branch: String,
    pub issues: Vec<Issue>,
    pub all_issues_closed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_request_iid: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_request_url: Option<String>,
    pub session_files: SessionFiles,
}

impl Milestone {
    /// Recompute `all_issues_closed` from the issue list.
    pub fn refresh_closed_flag(&mut self, now: DateTime<Utc>) {
        let closed = !self.issues.is_empty() && self.issues.iter().all(|i| i.state == IssueState::Closed);
        if closed && !self.all_issues_closed {
            self.completed_at = Some(now);
        }
        self.all_issues_closed = closed;
    }

    #[must_use]
    pub fn issue(&self, iid: u64) -> Option<&Issue> {
        self.issues.iter().find(|i| i.iid == iid)
    }

    pub fn issue_mut(&mut self, iid: u64) -> Option<&mut Issue> {
        self.issues.iter_mut().find(|i| i.iid == iid)
    }
}

/// Outcome of one quality check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Pass,
    Fail,
    Skipped,
}

impl CheckOutcome {
    #[must_use]
    pub const fn is_acceptable(&self) -> bool {
        matches!(self, Self::Pass | Self::Skipped)
    }
}

impl FromStr for CheckOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown check outcome: {other}")),
        }
    }
}

/// Recorded result of the quality-check runner for the current session.
///
/// Written by the AI subprocess after it runs the checks; the checkpoint
/// engine refuses terminal gates unless every recorded outcome is acceptable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub lint: CheckOutcome,
    pub format: CheckOutcome,
    pub types: CheckOutcome,
    pub tests: CheckOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<CheckOutcome>,
    pub recorded_at: DateTime<Utc>,
}

impl QualityReport {
    #[must_use]
    pub fn all_passing(&self) -> bool {
        self.lint.is_acceptable()
            && self.format.is_acceptable()
            && self.types.is_acceptable()
            && self.tests.is_acceptable()
            && self.browser.map_or(true, |b| b.is_acceptable())
    }
}

/// Daemon-owned record of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Monotonic integer assigned by the daemon
    pub agent_id: u64,
    pub spec_slug: String,
    pub spec_hash: String,
    pub project_dir: Utf8PathBuf,
    pub feature_branch: String,
    pub target_branch: String,
    pub auto_accept: bool,
    #[serde(default)]
    pub mode_flags: ModeFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<Utf8PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: AgentStatus,
    pub phase: Phase,
    pub last_event_at: DateTime<Utc>,
    /// Tail of the session log recorded when the agent failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
