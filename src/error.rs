//! Error taxonomy for the harness
//!
//! The split follows the failure classes the daemon has to tell apart:
//! schema/integrity problems are fatal and never auto-repaired, invariant
//! violations abort a session while leaving state untouched, external errors
//! are retried (transient) or surfaced (permanent), and protocol misuse is
//! answered with a structured error instead of crashing the daemon.

use thiserror::Error;

pub use crate::spec_id::SpecIdError;

/// Top-level error type returned by library operations.
///
/// Library code returns `HarnessError` and does NOT call
/// `std::process::exit`; the CLI maps errors to exit codes.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("workspace store error: {0}")]
    Store(#[from] StoreError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("host integration error: {0}")]
    Host(#[from] HostError),

    #[error("session runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("client protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("spec identity error: {0}")]
    SpecId(#[from] SpecIdError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the per-run workspace store (C1).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("workspace file not found: {path}")]
    NotFound { path: String },

    #[error("workspace file {path} failed schema validation: {reason}")]
    Schema { path: String, reason: String },

    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(action: &'static str, path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

/// Violations of the checkpoint-gate state machine (C2).
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("a pending checkpoint already exists in scope {scope} (id {existing})")]
    DuplicatePending { scope: String, existing: String },

    #[error("checkpoint not found: {checkpoint_id}")]
    Missing { checkpoint_id: String },

    #[error("checkpoint {checkpoint_id} is already {status}, not pending")]
    AlreadyResolved { checkpoint_id: String, status: String },

    #[error("modifications are only allowed with a 'modified' verdict")]
    ModificationsNotAllowed,

    #[error("checkpoint {checkpoint_id} is still pending and cannot be completed")]
    StillPending { checkpoint_id: String },

    #[error("checkpoint {checkpoint_id} is already completed")]
    AlreadyCompleted { checkpoint_id: String },

    #[error("approving a {kind} checkpoint requires modifications.human_decision")]
    MissingDecision { kind: String },

    #[error("cannot create {kind} checkpoint: no quality report recorded for this session")]
    VerificationMissing { kind: String },

    #[error("cannot create {kind} checkpoint: quality checks failed ({detail})")]
    VerificationFailed { kind: String, detail: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures from issue/MR host integrations.
///
/// `is_transient` drives the bounded retry loop; everything else surfaces
/// immediately.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("transient host failure during {op}: {reason}")]
    Transient { op: &'static str, reason: String },

    #[error("host authentication failed during {op}")]
    Auth { op: &'static str },

    #[error("host object not found during {op}: {what}")]
    NotFound { op: &'static str, what: String },

    #[error("file {path} is not tracked in this session and may not be pushed")]
    UntrackedFile { path: String },

    #[error("file path escapes the project root: {path}")]
    PathEscape { path: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HostError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Failures spawning or supervising the AI subprocess.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("failed to spawn agent subprocess '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stream agent subprocess output: {source}")]
    Stream {
        #[source]
        source: std::io::Error,
    },
}

/// Client-protocol misuse and daemon-side request failures.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed request frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown agent: {agent_id}")]
    UnknownAgent { agent_id: u64 },

    #[error("agent {agent_id} is running; stop it first")]
    AgentRunning { agent_id: u64 },

    #[error("a running agent already exists for {project_dir} ({spec_slug}-{spec_hash})")]
    DuplicateRun {
        project_dir: String,
        spec_slug: String,
        spec_hash: String,
    },

    #[error("daemon connection error: {source}")]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("daemon returned an error: {message}")]
    Remote { message: String },
}

impl From<std::io::Error> for ProtocolError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source }
    }
}
