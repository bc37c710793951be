//! Session orchestrator (C3)
//!
//! Drives one agent through the `initializer -> coding -> mr -> done` phase
//! machine. Each session is one fresh subprocess: the orchestrator reads all
//! state from the workspace at session start, runs the resumption gate, runs
//! the AI subprocess, and classifies the exit. Nothing survives in memory
//! between sessions.

mod session;

use camino::Utf8PathBuf;
use std::time::Duration;
use tokio::sync::watch;

use crate::checkpoint::CheckpointEngine;
use crate::error::HarnessError;
use crate::host::{IssueHost, RetryPolicy};
use crate::prompt::PromptLibrary;
use crate::runner::DEFAULT_STOP_GRACE;
use crate::store::WorkspaceStore;
use crate::types::{Checkpoint, CheckpointKind, Phase};

/// Sentinel an agent subprocess can emit on stderr to mark the session
/// failed even when its exit status is zero.
pub const AGENT_FAILURE_SENTINEL: &str = "AGENT_FATAL";

/// Exit codes of the internal `overseer session` subcommand. The daemon maps
/// these onto agent status; only 0/1/2 are part of the public CLI contract.
pub mod session_codes {
    /// Session finished cleanly; more sessions may follow
    pub const CLEAN: i32 = 0;
    /// Session failed
    pub const FAILED: i32 = 1;
    /// Session is suspended on a pending checkpoint
    pub const WAITING: i32 = 2;
    /// A rejection halted the run; do not respawn
    pub const HALTED: i32 = 3;
    /// The session was stopped on request
    pub const STOPPED: i32 = 4;
}

/// Configuration for one orchestrated agent.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub agent_id: u64,
    /// Program spawned as the AI subprocess (the Claude CLI in production,
    /// the stub in tests)
    pub agent_program: String,
    /// Extra arguments passed to the agent program
    pub agent_args: Vec<String>,
    /// Override directory for prompt templates
    pub templates_dir: Option<Utf8PathBuf>,
    /// Session log this run appends to
    pub log_path: Utf8PathBuf,
    /// Grace window between SIGTERM and SIGKILL on stop
    pub stop_grace: Duration,
    /// Retry policy for host integrations
    pub retry: RetryPolicy,
}

impl OrchestratorConfig {
    #[must_use]
    pub fn new(agent_id: u64, agent_program: impl Into<String>, log_path: Utf8PathBuf) -> Self {
        Self {
            agent_id,
            agent_program: agent_program.into(),
            agent_args: Vec::new(),
            templates_dir: None,
            log_path,
            stop_grace: DEFAULT_STOP_GRACE,
            retry: RetryPolicy::default(),
        }
    }
}

/// How a session ended, as reported to the daemon.
#[derive(Debug)]
pub enum SessionEnd {
    /// Suspended on a pending gate; do not run the AI subprocess again until
    /// it is resolved
    WaitingCheckpoint { checkpoint: Checkpoint },
    /// Clean exit with more work remaining in `phase`
    Continue { phase: Phase },
    /// The run is complete
    Done,
    /// A rejection halted the run
    Halted { reason: String },
    /// The session failed; `log_tail` carries diagnostics
    Failed { message: String, log_tail: String },
    /// Stopped on request
    Stopped,
}

impl SessionEnd {
    /// Exit code the `session` subcommand reports for this end state.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Continue { .. } | Self::Done => session_codes::CLEAN,
            Self::Failed { .. } => session_codes::FAILED,
            Self::WaitingCheckpoint { .. } => session_codes::WAITING,
            Self::Halted { .. } => session_codes::HALTED,
            Self::Stopped => session_codes::STOPPED,
        }
    }
}

/// Orchestrator for one agent's sessions.
pub struct Orchestrator {
    store: WorkspaceStore,
    engine: CheckpointEngine,
    host: Box<dyn IssueHost>,
    prompts: PromptLibrary,
    config: OrchestratorConfig,
}

impl Orchestrator {
    #[must_use]
    pub fn new(store: WorkspaceStore, host: Box<dyn IssueHost>, config: OrchestratorConfig) -> Self {
        let engine = CheckpointEngine::new(store.clone());
        let prompts = PromptLibrary::new(config.templates_dir.clone());
        Self {
            store,
            engine,
            host,
            prompts,
            config,
        }
    }

    #[must_use]
    pub fn store(&self) -> &WorkspaceStore {
        &self.store
    }

    #[must_use]
    pub fn engine(&self) -> &CheckpointEngine {
        &self.engine
    }

    /// Derive the current phase from durable state alone.
    pub fn determine_phase(&self) -> Result<Phase, HarnessError> {
        derive_phase(&self.store)
    }

    /// Run one session. See `session.rs` for the body.
    pub async fn run_session(&self, stop_rx: watch::Receiver<bool>) -> Result<SessionEnd, HarnessError> {
        self.run_session_inner(stop_rx).await
    }
}

/// Derive the phase of a run from its durable state alone.
///
/// * no milestone, no issues, or the enrichment gate not yet acted on ->
///   initializer
/// * merge request recorded (or MR creation skipped after all issues
///   closed) -> done
/// * all issues closed and the transition gate approved and acted on -> mr
/// * otherwise -> coding
pub fn derive_phase(store: &WorkspaceStore) -> Result<Phase, HarnessError> {
    if !store.milestone_exists() {
        return Ok(Phase::Initializer);
    }
    let info = store.workspace_info()?;
    let milestone = store.milestone()?;
    let engine = CheckpointEngine::new(store.clone());

    if milestone.issues.is_empty() {
        return Ok(Phase::Initializer);
    }
    // Coding starts only after the enrichment question is settled, whatever
    // the verdict was.
    let enrichment_settled = engine
        .latest_of_kind(CheckpointKind::IssueEnrichment)?
        .is_some_and(|c| c.completed);
    if !enrichment_settled {
        return Ok(Phase::Initializer);
    }

    if milestone.merge_request_iid.is_some() {
        return Ok(Phase::Done);
    }
    if milestone.all_issues_closed {
        if info.mode_flags.skip_mr_creation {
            return Ok(Phase::Done);
        }
        if engine.kind_approved_and_completed(CheckpointKind::MrPhaseTransition)? {
            return Ok(Phase::Mr);
        }
    }
    Ok(Phase::Coding)
}
