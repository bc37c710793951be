//! Command-line surface
//!
//! Client commands talk to the daemon over the socket. The `session`,
//! `checkpoint`, `files` and `quality` subcommands are the internal surface:
//! `session` is what the daemon spawns per session, and the other three are
//! how the AI subprocess records gates, tracked files, and check outcomes
//! through C1/C2 instead of writing raw JSON.

use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::watch;

use crate::checkpoint::CheckpointEngine;
use crate::daemon::{Daemon, DaemonClient, DaemonConfig, StartArgs};
use crate::exit_codes::codes;
use crate::host::FileOnlyHost;
use crate::orchestrator::{Orchestrator, OrchestratorConfig, SessionEnd};
use crate::paths;
use crate::store::WorkspaceStore;
use crate::types::{
    AgentStatus, CheckOutcome, CheckpointKind, ModeFlags, QualityReport, Scope, Verdict,
};

#[derive(Parser, Debug)]
#[command(name = "overseer", version, about = "Daemon-supervised harness for autonomous coding agents")]
pub struct Cli {
    /// Verbose logging
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the agent daemon in the foreground
    Daemon(DaemonArgs),
    /// Start a new agent for a spec file
    Start(StartCmd),
    /// List all agents
    List,
    /// Show one agent (exit code 2 when it waits on a checkpoint)
    Status { agent_id: u64 },
    /// Gracefully stop an agent's running session
    Stop { agent_id: u64 },
    /// Remove a stopped agent from the registry
    Remove { agent_id: u64 },
    /// Resolve a pending checkpoint
    Resolve(ResolveCmd),
    /// Stream status events (optionally for one agent)
    Attach { agent_id: Option<u64> },
    /// Shut the daemon down
    Shutdown,
    /// Internal: run one orchestrated session (spawned by the daemon)
    #[command(hide = true)]
    Session(SessionCmd),
    /// Checkpoint operations for the AI subprocess
    #[command(subcommand)]
    Checkpoint(CheckpointCmd),
    /// Session file tracking for the AI subprocess
    #[command(subcommand)]
    Files(FilesCmd),
    /// Quality-check recording for the AI subprocess
    #[command(subcommand)]
    Quality(QualityCmd),
}

#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Program to spawn as the AI subprocess (default: claude)
    #[arg(long)]
    pub agent_program: Option<String>,
    /// Extra argument for the agent program (repeatable)
    #[arg(long = "agent-arg")]
    pub agent_args: Vec<String>,
    /// Override directory for prompt templates
    #[arg(long)]
    pub templates_dir: Option<Utf8PathBuf>,
    /// Seconds between SIGTERM and SIGKILL when stopping agents
    #[arg(long, default_value_t = 30)]
    pub stop_grace_secs: u64,
    /// Milliseconds between a clean session exit and the next spawn
    #[arg(long, default_value_t = 1000)]
    pub respawn_delay_ms: u64,
}

#[derive(Args, Debug)]
pub struct StartCmd {
    /// Project root the agent works in
    #[arg(long)]
    pub project_dir: Utf8PathBuf,
    /// Path to the specification file
    #[arg(long)]
    pub spec_file: Utf8PathBuf,
    /// Branch the merge request will target
    #[arg(long, default_value = "main")]
    pub target_branch: String,
    /// Resolve every checkpoint with its auto-verdict
    #[arg(long)]
    pub auto_accept: bool,
    /// Track issues in local JSON instead of an external host
    #[arg(long)]
    pub file_only_mode: bool,
    /// End the run without creating a merge request
    #[arg(long)]
    pub skip_mr_creation: bool,
    /// Skip browser-automation verification
    #[arg(long)]
    pub skip_puppeteer: bool,
    /// Skip the test-suite quality check
    #[arg(long)]
    pub skip_test_suite: bool,
    /// Skip regression sweeps over closed issues
    #[arg(long)]
    pub skip_regression_testing: bool,
}

#[derive(Args, Debug)]
pub struct ResolveCmd {
    pub agent_id: u64,
    pub checkpoint_id: String,
    /// approved, modified, or rejected
    #[arg(long)]
    pub verdict: Verdict,
    /// Kind-specific structured override, as JSON
    #[arg(long)]
    pub modifications: Option<String>,
    /// Free-text notes for the agent
    #[arg(long)]
    pub notes: Option<String>,
}

#[derive(Args, Debug)]
pub struct SessionCmd {
    #[arg(long)]
    pub project_dir: Utf8PathBuf,
    #[arg(long)]
    pub spec_slug: String,
    #[arg(long)]
    pub spec_hash: String,
    #[arg(long)]
    pub agent_id: u64,
    #[arg(long)]
    pub log_file: Utf8PathBuf,
    #[arg(long, default_value = "claude")]
    pub agent_program: String,
    #[arg(long = "agent-arg")]
    pub agent_args: Vec<String>,
    #[arg(long)]
    pub templates_dir: Option<Utf8PathBuf>,
    #[arg(long, default_value_t = 30)]
    pub stop_grace_secs: u64,
}

#[derive(Subcommand, Debug)]
pub enum CheckpointCmd {
    /// Create a pending checkpoint and print its id
    Create(CheckpointCreateCmd),
    /// Mark a resolved checkpoint as acted on
    Complete {
        checkpoint_id: String,
        #[command(flatten)]
        workspace: WorkspaceArgs,
    },
}

#[derive(Args, Debug)]
pub struct CheckpointCreateCmd {
    /// Checkpoint kind (e.g. issue_selection)
    #[arg(long)]
    pub kind: CheckpointKind,
    /// "global" or an issue iid
    #[arg(long, default_value = "global")]
    pub scope: Scope,
    /// Kind-specific context, as inline JSON
    #[arg(long)]
    pub context: Option<String>,
    /// Kind-specific context, read from a JSON file
    #[arg(long)]
    pub context_file: Option<Utf8PathBuf>,
    #[command(flatten)]
    pub workspace: WorkspaceArgs,
}

#[derive(Subcommand, Debug)]
pub enum FilesCmd {
    /// Record files this session has modified
    Track {
        paths: Vec<String>,
        #[command(flatten)]
        workspace: WorkspaceArgs,
    },
}

#[derive(Subcommand, Debug)]
pub enum QualityCmd {
    /// Record the quality-check runner's outcome for this session
    Record(QualityRecordCmd),
}

#[derive(Args, Debug)]
pub struct QualityRecordCmd {
    #[arg(long, default_value = "pass")]
    pub lint: CheckOutcome,
    #[arg(long, default_value = "pass")]
    pub format: CheckOutcome,
    #[arg(long, default_value = "pass")]
    pub types: CheckOutcome,
    #[arg(long, default_value = "pass")]
    pub tests: CheckOutcome,
    #[arg(long)]
    pub browser: Option<CheckOutcome>,
    #[command(flatten)]
    pub workspace: WorkspaceArgs,
}

/// Workspace coordinates, from flags or the environment the orchestrator
/// sets for the AI subprocess.
#[derive(Args, Debug)]
pub struct WorkspaceArgs {
    #[arg(long)]
    pub project_dir: Option<Utf8PathBuf>,
    #[arg(long)]
    pub spec_slug: Option<String>,
    #[arg(long)]
    pub spec_hash: Option<String>,
}

impl WorkspaceArgs {
    fn resolve(&self) -> Result<WorkspaceStore> {
        let project_dir = self
            .project_dir
            .clone()
            .or_else(|| std::env::var("OVERSEER_PROJECT_DIR").ok().map(Utf8PathBuf::from))
            .ok_or_else(|| anyhow!("--project-dir or OVERSEER_PROJECT_DIR is required"))?;
        let spec_slug = self
            .spec_slug
            .clone()
            .or_else(|| std::env::var("OVERSEER_SPEC_SLUG").ok())
            .ok_or_else(|| anyhow!("--spec-slug or OVERSEER_SPEC_SLUG is required"))?;
        let spec_hash = self
            .spec_hash
            .clone()
            .or_else(|| std::env::var("OVERSEER_SPEC_HASH").ok())
            .ok_or_else(|| anyhow!("--spec-hash or OVERSEER_SPEC_HASH is required"))?;
        Ok(WorkspaceStore::open(&project_dir, &spec_slug, &spec_hash))
    }
}

/// Run the parsed CLI and return the process exit code.
pub async fn run(cli: Cli) -> i32 {
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            codes::OPERATIONAL
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Daemon(args) => run_daemon(args).await,
        Command::Start(args) => run_start(args).await,
        Command::List => run_list().await,
        Command::Status { agent_id } => run_status(agent_id).await,
        Command::Stop { agent_id } => run_stop(agent_id).await,
        Command::Remove { agent_id } => run_remove(agent_id).await,
        Command::Resolve(args) => run_resolve(args).await,
        Command::Attach { agent_id } => run_attach(agent_id).await,
        Command::Shutdown => run_shutdown().await,
        Command::Session(args) => run_session(args).await,
        Command::Checkpoint(cmd) => run_checkpoint(cmd),
        Command::Files(cmd) => run_files(cmd),
        Command::Quality(cmd) => run_quality(cmd),
    }
}

async fn connect() -> Result<DaemonClient> {
    DaemonClient::connect(&paths::daemon_socket())
        .await
        .map_err(Into::into)
}

async fn run_daemon(args: DaemonArgs) -> Result<i32> {
    if let Some(dir) = &args.templates_dir {
        crate::prompt::check_templates_dir(dir)
            .with_context(|| format!("invalid --templates-dir {dir}"))?;
    }
    let mut config = DaemonConfig::resolve(args.agent_program)?;
    config.agent_args = args.agent_args;
    config.templates_dir = args.templates_dir;
    config.stop_grace = Duration::from_secs(args.stop_grace_secs);
    config.respawn_delay = Duration::from_millis(args.respawn_delay_ms);

    let daemon = Daemon::new(config)?;
    daemon.run().await?;
    Ok(codes::SUCCESS)
}

async fn run_start(args: StartCmd) -> Result<i32> {
    let spec_file = Utf8PathBuf::from_path_buf(
        std::fs::canonicalize(args.spec_file.as_std_path())
            .with_context(|| format!("spec file not found: {}", args.spec_file))?,
    )
    .map_err(|p| anyhow!("spec file path is not valid UTF-8: {}", p.display()))?;

    let mut client = connect().await?;
    let record = client
        .start(StartArgs {
            project_dir: args.project_dir,
            spec_file,
            target_branch: args.target_branch,
            auto_accept: args.auto_accept,
            mode_flags: ModeFlags {
                file_only_mode: args.file_only_mode,
                skip_mr_creation: args.skip_mr_creation,
                skip_puppeteer: args.skip_puppeteer,
                skip_test_suite: args.skip_test_suite,
                skip_regression_testing: args.skip_regression_testing,
            },
        })
        .await?;
    println!(
        "agent {} started: {}-{} in {}",
        record.agent_id, record.spec_slug, record.spec_hash, record.project_dir
    );
    Ok(codes::SUCCESS)
}

async fn run_list() -> Result<i32> {
    let mut client = connect().await?;
    let records = client.list().await?;
    if records.is_empty() {
        println!("no agents");
        return Ok(codes::SUCCESS);
    }
    for record in records {
        println!(
            "{:>4}  {:<19} {:<12} {}-{}  {}",
            record.agent_id, record.status, record.phase, record.spec_slug, record.spec_hash, record.project_dir
        );
    }
    Ok(codes::SUCCESS)
}

async fn run_status(agent_id: u64) -> Result<i32> {
    let mut client = connect().await?;
    let record = client.status(agent_id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    if record.status == AgentStatus::WaitingCheckpoint {
        return Ok(codes::WAITING_CHECKPOINT);
    }
    Ok(codes::SUCCESS)
}

async fn run_stop(agent_id: u64) -> Result<i32> {
    let mut client = connect().await?;
    let record = client.stop(agent_id).await?;
    println!("agent {} -> {}", record.agent_id, record.status);
    Ok(codes::SUCCESS)
}

async fn run_remove(agent_id: u64) -> Result<i32> {
    let mut client = connect().await?;
    let record = client.remove(agent_id).await?;
    println!("agent {} removed", record.agent_id);
    Ok(codes::SUCCESS)
}

async fn run_resolve(args: ResolveCmd) -> Result<i32> {
    let modifications = args
        .modifications
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("--modifications must be valid JSON")?;

    let mut client = connect().await?;
    let checkpoint = client
        .resolve_checkpoint(
            args.agent_id,
            &args.checkpoint_id,
            args.verdict,
            modifications,
            args.notes,
        )
        .await?;
    println!(
        "checkpoint {} ({}) -> {}",
        checkpoint.checkpoint_id, checkpoint.kind, checkpoint.status
    );
    Ok(codes::SUCCESS)
}

async fn run_attach(agent_id: Option<u64>) -> Result<i32> {
    let mut client = connect().await?;
    let snapshot = client.subscribe(agent_id).await?;
    for record in snapshot {
        println!(
            "{:>4}  {:<19} {:<12} {}-{}",
            record.agent_id, record.status, record.phase, record.spec_slug, record.spec_hash
        );
    }
    while let Some(event) = client.next_event().await? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(codes::SUCCESS)
}

async fn run_shutdown() -> Result<i32> {
    let mut client = connect().await?;
    client.shutdown().await?;
    println!("daemon shutting down");
    Ok(codes::SUCCESS)
}

async fn run_session(args: SessionCmd) -> Result<i32> {
    let store = WorkspaceStore::open(&args.project_dir, &args.spec_slug, &args.spec_hash);
    let repository = format!(
        "local/{}",
        args.project_dir.file_name().unwrap_or("project")
    );
    let host = Box::new(FileOnlyHost::new(&store.host_dir(), &repository));

    let mut config = OrchestratorConfig::new(args.agent_id, args.agent_program, args.log_file);
    config.agent_args = args.agent_args;
    config.templates_dir = args.templates_dir;
    config.stop_grace = Duration::from_secs(args.stop_grace_secs);

    let orchestrator = Orchestrator::new(store, host, config);

    let (stop_tx, stop_rx) = watch::channel(false);
    #[cfg(unix)]
    {
        let stop_tx = stop_tx.clone();
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            let _ = stop_tx.send(true);
        });
    }
    drop(stop_tx);

    let end = orchestrator.run_session(stop_rx).await?;
    match &end {
        SessionEnd::WaitingCheckpoint { checkpoint } => {
            println!(
                "waiting on {} checkpoint {}",
                checkpoint.kind, checkpoint.checkpoint_id
            );
        }
        SessionEnd::Continue { phase } => println!("session complete; continuing in {phase} phase"),
        SessionEnd::Done => println!("run complete"),
        SessionEnd::Halted { reason } => println!("halted: {reason}"),
        SessionEnd::Failed { message, .. } => eprintln!("session failed: {message}"),
        SessionEnd::Stopped => println!("session stopped"),
    }
    Ok(end.exit_code())
}

fn run_checkpoint(cmd: CheckpointCmd) -> Result<i32> {
    match cmd {
        CheckpointCmd::Create(args) => {
            let store = args.workspace.resolve()?;
            let context = match (&args.context, &args.context_file) {
                (Some(inline), _) => serde_json::from_str(inline).context("--context must be valid JSON")?,
                (None, Some(path)) => {
                    let bytes = std::fs::read(path.as_std_path())
                        .with_context(|| format!("cannot read context file {path}"))?;
                    serde_json::from_slice(&bytes).context("context file must be valid JSON")?
                }
                (None, None) => Value::Object(serde_json::Map::new()),
            };
            let engine = CheckpointEngine::new(store);
            let id = engine.create(args.kind, args.scope, context)?;
            println!("{id}");
            Ok(codes::SUCCESS)
        }
        CheckpointCmd::Complete {
            checkpoint_id,
            workspace,
        } => {
            let store = workspace.resolve()?;
            let engine = CheckpointEngine::new(store);
            let completed = engine.complete(&checkpoint_id)?;
            println!("checkpoint {} completed", completed.checkpoint_id);
            Ok(codes::SUCCESS)
        }
    }
}

fn run_files(cmd: FilesCmd) -> Result<i32> {
    match cmd {
        FilesCmd::Track { paths, workspace } => {
            let store = workspace.resolve()?;
            let count = paths.len();
            store.track_files(paths)?;
            println!("tracked {count} file(s)");
            Ok(codes::SUCCESS)
        }
    }
}

fn run_quality(cmd: QualityCmd) -> Result<i32> {
    match cmd {
        QualityCmd::Record(args) => {
            let store = args.workspace.resolve()?;
            store.write_quality_report(&QualityReport {
                lint: args.lint,
                format: args.format,
                types: args.types,
                tests: args.tests,
                browser: args.browser,
                recorded_at: chrono::Utc::now(),
            })?;
            println!("quality report recorded");
            Ok(codes::SUCCESS)
        }
    }
}
