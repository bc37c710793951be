//! The agent daemon (C4)
//!
//! Hosts the registry of agents, accepts client commands on a Unix socket,
//! spawns one `overseer session` child per session, supervises child exits,
//! and persists every registry change. Clients are ephemeral: the daemon and
//! the workspace files carry all durable state.

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::checkpoint::CheckpointEngine;
use crate::error::{HarnessError, ProtocolError};
use crate::orchestrator::{derive_phase, session_codes};
use crate::paths;
use crate::runner::DEFAULT_STOP_GRACE;
use crate::store::WorkspaceStore;
use crate::types::{AgentRecord, AgentStatus, Phase};

use super::protocol::{read_frame, write_frame, Event, Request, ResolveArgs, Response, StartArgs};
use super::registry::{pid_alive, NewAgent, Registry};

/// Daemon configuration, resolved from the runtime dir by default.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: Utf8PathBuf,
    pub pid_path: Utf8PathBuf,
    pub registry_path: Utf8PathBuf,
    /// Binary spawned for sessions; defaults to the current executable
    pub session_program: Utf8PathBuf,
    /// AI subprocess program handed through to sessions
    pub agent_program: String,
    pub agent_args: Vec<String>,
    pub templates_dir: Option<Utf8PathBuf>,
    pub stop_grace: Duration,
    /// Pause between a clean session exit and the next spawn
    pub respawn_delay: Duration,
}

impl DaemonConfig {
    /// Default configuration under the resolved runtime directory.
    pub fn resolve(agent_program: Option<String>) -> Result<Self, HarnessError> {
        let session_program = std::env::current_exe()
            .ok()
            .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
            .unwrap_or_else(|| Utf8PathBuf::from("overseer"));
        Ok(Self {
            socket_path: paths::daemon_socket(),
            pid_path: paths::daemon_pid_file(),
            registry_path: paths::daemon_registry(),
            session_program,
            agent_program: agent_program.unwrap_or_else(|| "claude".to_string()),
            agent_args: Vec::new(),
            templates_dir: None,
            stop_grace: DEFAULT_STOP_GRACE,
            respawn_delay: Duration::from_secs(1),
        })
    }
}

struct ChildHandle {
    pid: u32,
    stop_requested: Arc<AtomicBool>,
}

struct DaemonInner {
    config: DaemonConfig,
    registry: Mutex<Registry>,
    children: Mutex<HashMap<u64, ChildHandle>>,
    events: broadcast::Sender<Event>,
    shutdown: watch::Sender<bool>,
}

/// The daemon process.
pub struct Daemon {
    inner: Arc<DaemonInner>,
}

impl Daemon {
    /// Load and reconcile the registry, becoming ready to serve.
    pub fn new(config: DaemonConfig) -> Result<Self, HarnessError> {
        paths::ensure_dir_all(
            config
                .registry_path
                .parent()
                .unwrap_or(Utf8Path::new("."))
                .as_std_path(),
        )?;
        let mut registry = Registry::load_or_default(&config.registry_path)?;
        let changed = registry.reconcile()?;
        if !changed.is_empty() {
            info!(agents = ?changed, "reconciled agents whose sessions did not survive the restart");
        }

        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(DaemonInner {
                config,
                registry: Mutex::new(registry),
                children: Mutex::new(HashMap::new()),
                events,
                shutdown,
            }),
        })
    }

    /// Serve until shutdown. Reclaims a stale socket left by a dead daemon.
    pub async fn run(&self) -> Result<(), HarnessError> {
        let inner = &self.inner;
        let socket = &inner.config.socket_path;
        paths::ensure_dir_all(socket.parent().unwrap_or(Utf8Path::new(".")).as_std_path())?;

        if socket.exists() {
            match UnixStream::connect(socket.as_std_path()).await {
                Ok(_) => {
                    return Err(ProtocolError::Remote {
                        message: format!("another daemon is already listening on {socket}"),
                    }
                    .into());
                }
                Err(_) => {
                    warn!(%socket, "removing stale socket from a dead daemon");
                    std::fs::remove_file(socket.as_std_path())?;
                }
            }
        }

        let listener = UnixListener::bind(socket.as_std_path())?;
        std::fs::write(inner.config.pid_path.as_std_path(), std::process::id().to_string())?;
        info!(%socket, pid = std::process::id(), "daemon ready");

        let mut shutdown_rx = inner.shutdown.subscribe();
        #[cfg(unix)]
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        loop {
            #[cfg(unix)]
            let signal_wait = sigterm.recv();
            #[cfg(not(unix))]
            let signal_wait = std::future::pending::<Option<()>>();

            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted?;
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(inner, stream).await {
                            warn!(error = %e, "client connection ended with error");
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    let _ = inner.shutdown.send(true);
                }
                _ = signal_wait => {
                    info!("termination signal received, shutting down");
                    let _ = inner.shutdown.send(true);
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown_cleanup().await;
        Ok(())
    }

    async fn shutdown_cleanup(&self) {
        let agent_ids: Vec<u64> = {
            let children = self.inner.children.lock().expect("children mutex");
            children.keys().copied().collect()
        };
        for agent_id in agent_ids {
            let _ = stop_agent(&self.inner, agent_id);
        }
        // Give graceful termination a moment before the process exits.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = std::fs::remove_file(self.inner.config.socket_path.as_std_path());
        let _ = std::fs::remove_file(self.inner.config.pid_path.as_std_path());
        info!("daemon stopped");
    }
}

async fn handle_client(inner: Arc<DaemonInner>, mut stream: UnixStream) -> Result<(), ProtocolError> {
    loop {
        let request: Option<Request> = match read_frame(&mut stream).await {
            Ok(request) => request,
            Err(ProtocolError::MalformedFrame { reason }) => {
                // Protocol misuse never crashes the daemon; answer and move on.
                write_frame(&mut stream, &Response::failure(format!("malformed request: {reason}"))).await?;
                continue;
            }
            Err(e) => return Err(e),
        };
        let Some(request) = request else {
            return Ok(());
        };

        if let Request::Subscribe { agent_id } = request {
            return serve_subscription(inner, stream, agent_id).await;
        }

        let response = dispatch(&inner, request).await;
        write_frame(&mut stream, &response).await?;
    }
}

async fn serve_subscription(
    inner: Arc<DaemonInner>,
    mut stream: UnixStream,
    filter: Option<u64>,
) -> Result<(), ProtocolError> {
    // Snapshot first so the client never misses the current state.
    let snapshot: Vec<AgentRecord> = {
        let registry = inner.registry.lock().expect("registry mutex");
        registry.records().cloned().collect()
    };
    write_frame(&mut stream, &Response::success(serde_json::to_value(snapshot).unwrap_or(Value::Null))).await?;

    let mut events = inner.events.subscribe();
    let mut shutdown_rx = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if filter.is_some_and(|id| id != event.agent_id) {
                            continue;
                        }
                        write_frame(&mut stream, &event).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn dispatch(inner: &Arc<DaemonInner>, request: Request) -> Response {
    let result: Result<Value, HarnessError> = match request {
        Request::Ping => Ok(json!("pong")),
        Request::List => Ok({
            let registry = inner.registry.lock().expect("registry mutex");
            let records: Vec<AgentRecord> = registry.records().cloned().collect();
            serde_json::to_value(records).unwrap_or(Value::Null)
        }),
        Request::Status { agent_id } => status_agent(inner, agent_id),
        Request::Start(args) => start_agent(inner, args),
        Request::Stop { agent_id } => stop_agent(inner, agent_id),
        Request::Remove { agent_id } => remove_agent(inner, agent_id),
        Request::ResolveCheckpoint(args) => resolve_checkpoint(inner, args),
        Request::Shutdown => {
            let _ = inner.shutdown.send(true);
            Ok(json!("shutting down"))
        }
        Request::Subscribe { .. } => unreachable!("subscribe handled by the connection loop"),
    };

    match result {
        Ok(value) => Response::success(value),
        Err(e) => Response::failure(e.to_string()),
    }
}

fn status_agent(inner: &Arc<DaemonInner>, agent_id: u64) -> Result<Value, HarnessError> {
    let registry = inner.registry.lock().expect("registry mutex");
    let record = registry
        .get(agent_id)
        .ok_or(ProtocolError::UnknownAgent { agent_id })?;
    Ok(serde_json::to_value(record).unwrap_or(Value::Null))
}

fn start_agent(inner: &Arc<DaemonInner>, args: StartArgs) -> Result<Value, HarnessError> {
    if !args.project_dir.is_dir() {
        return Err(ProtocolError::Remote {
            message: format!("project directory does not exist: {}", args.project_dir),
        }
        .into());
    }
    let project_dir = canonicalize_utf8(&args.project_dir)?;

    let (_, info) = WorkspaceStore::bootstrap(
        &project_dir,
        &args.spec_file,
        &args.target_branch,
        args.auto_accept,
        args.mode_flags,
    )?;

    let record = {
        let mut registry = inner.registry.lock().expect("registry mutex");
        if let Some(live) = registry.find_live_run(&project_dir, &info.spec_slug, &info.spec_hash) {
            return Err(ProtocolError::DuplicateRun {
                project_dir: project_dir.to_string(),
                spec_slug: live.spec_slug.clone(),
                spec_hash: live.spec_hash.clone(),
            }
            .into());
        }
        registry.allocate(NewAgent {
            spec_slug: info.spec_slug.clone(),
            spec_hash: info.spec_hash.clone(),
            project_dir: project_dir.clone(),
            feature_branch: info.feature_branch.clone(),
            target_branch: info.target_branch.clone(),
            auto_accept: args.auto_accept,
            mode_flags: args.mode_flags,
        })?
    };

    spawn_session(inner, record.agent_id)?;
    emit(inner, "agent_started", record.agent_id, json!({ "agent_id": record.agent_id }));
    status_agent(inner, record.agent_id)
}

/// Launch one `overseer session` child for the agent and supervise it.
fn spawn_session(inner: &Arc<DaemonInner>, agent_id: u64) -> Result<(), HarnessError> {
    let record = {
        let registry = inner.registry.lock().expect("registry mutex");
        registry
            .get(agent_id)
            .cloned()
            .ok_or(ProtocolError::UnknownAgent { agent_id })?
    };

    let store = WorkspaceStore::open(&record.project_dir, &record.spec_slug, &record.spec_hash);
    let log_path = store.new_session_log(agent_id)?;
    WorkspaceStore::append_log(&log_path, &format!("=== agent {agent_id} session starting ==="))?;
    WorkspaceStore::append_log(
        &log_path,
        &format!(
            "command: {} session --project-dir {} --spec-slug {} --spec-hash {}",
            inner.config.session_program, record.project_dir, record.spec_slug, record.spec_hash
        ),
    )?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path.as_std_path())
        .map_err(HarnessError::Io)?;
    let log_file_err = log_file.try_clone().map_err(HarnessError::Io)?;

    let mut cmd = tokio::process::Command::new(inner.config.session_program.as_std_path());
    cmd.arg("session")
        .arg("--project-dir")
        .arg(record.project_dir.as_str())
        .arg("--spec-slug")
        .arg(&record.spec_slug)
        .arg("--spec-hash")
        .arg(&record.spec_hash)
        .arg("--agent-id")
        .arg(agent_id.to_string())
        .arg("--log-file")
        .arg(log_path.as_str())
        .arg("--agent-program")
        .arg(&inner.config.agent_program)
        .arg("--stop-grace-secs")
        .arg(inner.config.stop_grace.as_secs().to_string());
    for agent_arg in &inner.config.agent_args {
        cmd.arg("--agent-arg").arg(agent_arg);
    }
    if let Some(dir) = &inner.config.templates_dir {
        cmd.arg("--templates-dir").arg(dir.as_str());
    }
    cmd.current_dir(record.project_dir.as_std_path())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::from(log_file))
        .stderr(std::process::Stdio::from(log_file_err));
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn().map_err(|e| {
        HarnessError::Runner(crate::error::RunnerError::Spawn {
            program: inner.config.session_program.to_string(),
            source: e,
        })
    })?;
    let pid = child.id().unwrap_or_default();

    {
        let mut registry = inner.registry.lock().expect("registry mutex");
        registry.update(agent_id, |r| {
            r.pid = Some(pid);
            r.status = AgentStatus::Running;
            r.log_path = Some(log_path.clone());
            r.last_error = None;
        })?;
    }
    emit_status(inner, agent_id);

    let stop_requested = Arc::new(AtomicBool::new(false));
    {
        let mut children = inner.children.lock().expect("children mutex");
        children.insert(
            agent_id,
            ChildHandle {
                pid,
                stop_requested: Arc::clone(&stop_requested),
            },
        );
    }

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        supervise(inner, agent_id, child, stop_requested).await;
    });
    Ok(())
}

/// Watch one session child; on exit, translate its exit code into agent
/// state and decide whether to spawn the next session.
async fn supervise(
    inner: Arc<DaemonInner>,
    agent_id: u64,
    mut child: tokio::process::Child,
    stop_requested: Arc<AtomicBool>,
) {
    let status = child.wait().await;
    {
        let mut children = inner.children.lock().expect("children mutex");
        children.remove(&agent_id);
    }

    let code = status.as_ref().ok().and_then(std::process::ExitStatus::code);
    let stopped = stop_requested.load(Ordering::SeqCst);

    let (record, respawn) = {
        let mut registry = inner.registry.lock().expect("registry mutex");
        let Some(current) = registry.get(agent_id).cloned() else {
            return;
        };
        let store = WorkspaceStore::open(&current.project_dir, &current.spec_slug, &current.spec_hash);
        let phase = derive_phase(&store).unwrap_or(current.phase);

        let mut respawn = false;
        let record = registry
            .update(agent_id, |r| {
                r.pid = None;
                r.phase = phase;
                if stopped {
                    r.status = AgentStatus::Stopped;
                } else {
                    match code {
                        Some(code) if code == session_codes::CLEAN => {
                            if phase == Phase::Done {
                                r.status = AgentStatus::Done;
                            } else {
                                r.status = AgentStatus::Running;
                                respawn = true;
                            }
                        }
                        Some(code) if code == session_codes::WAITING => {
                            r.status = AgentStatus::WaitingCheckpoint;
                        }
                        Some(code) if code == session_codes::HALTED || code == session_codes::STOPPED => {
                            r.status = AgentStatus::Stopped;
                        }
                        other => {
                            r.status = AgentStatus::Failed;
                            let tail = r
                                .log_path
                                .as_deref()
                                .map(|p| WorkspaceStore::log_tail(p, 2048))
                                .unwrap_or_default();
                            r.last_error = Some(format!(
                                "session exited with {}\n{tail}",
                                other.map_or_else(|| "signal".to_string(), |c| format!("code {c}"))
                            ));
                        }
                    }
                }
            })
            .ok()
            .flatten();
        (record, respawn)
    };

    if let Some(record) = &record {
        info!(agent_id, status = %record.status, phase = %record.phase, "session ended");
        if let Some(log_path) = &record.log_path {
            let trailer = format!(
                "=== agent {agent_id} session ended: {} (exit {}) ===",
                record.status,
                code.map_or_else(|| "signal".to_string(), |c| c.to_string())
            );
            let _ = WorkspaceStore::append_log(log_path, &trailer);
        }
    }
    emit_status(&inner, agent_id);

    if respawn && !*inner.shutdown.borrow() {
        tokio::time::sleep(inner.config.respawn_delay).await;
        let still_running = {
            let registry = inner.registry.lock().expect("registry mutex");
            registry.get(agent_id).is_some_and(|r| r.status == AgentStatus::Running)
        };
        if still_running && !*inner.shutdown.borrow() {
            if let Err(e) = spawn_session(&inner, agent_id) {
                warn!(agent_id, error = %e, "failed to spawn next session");
                let mut registry = inner.registry.lock().expect("registry mutex");
                let _ = registry.update(agent_id, |r| {
                    r.status = AgentStatus::Failed;
                    r.last_error = Some(format!("failed to spawn next session: {e}"));
                });
            }
        }
    }
}

fn stop_agent(inner: &Arc<DaemonInner>, agent_id: u64) -> Result<Value, HarnessError> {
    let handle = {
        let children = inner.children.lock().expect("children mutex");
        children
            .get(&agent_id)
            .map(|h| (h.pid, Arc::clone(&h.stop_requested)))
    };

    match handle {
        Some((pid, stop_requested)) => {
            stop_requested.store(true, Ordering::SeqCst);
            signal_session_group(pid, libc::SIGTERM);
            let grace = inner.config.stop_grace;
            let inner_clone = Arc::clone(inner);
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let still_running = {
                    let children = inner_clone.children.lock().expect("children mutex");
                    children.get(&agent_id).is_some_and(|h| h.pid == pid)
                };
                if still_running {
                    warn!(agent_id, pid, "grace window elapsed, force-killing session");
                    signal_session_group(pid, libc::SIGKILL);
                }
            });
        }
        None => {
            // No live child. If the record claims otherwise, repair it.
            let mut registry = inner.registry.lock().expect("registry mutex");
            registry.update(agent_id, |r| {
                if r.status == AgentStatus::Running {
                    r.status = AgentStatus::Stopped;
                    r.pid = None;
                }
            })?;
        }
    }
    status_agent(inner, agent_id)
}

fn remove_agent(inner: &Arc<DaemonInner>, agent_id: u64) -> Result<Value, HarnessError> {
    {
        let children = inner.children.lock().expect("children mutex");
        if children.contains_key(&agent_id) {
            return Err(ProtocolError::AgentRunning { agent_id }.into());
        }
    }
    let removed = {
        let mut registry = inner.registry.lock().expect("registry mutex");
        if registry.get(agent_id).is_some_and(|r| r.status == AgentStatus::Running && r.pid.is_some_and(pid_alive)) {
            return Err(ProtocolError::AgentRunning { agent_id }.into());
        }
        registry.remove(agent_id)?
    };
    let removed = removed.ok_or(ProtocolError::UnknownAgent { agent_id })?;
    emit(inner, "agent_removed", agent_id, json!({ "agent_id": agent_id }));
    Ok(serde_json::to_value(removed).unwrap_or(Value::Null))
}

fn resolve_checkpoint(inner: &Arc<DaemonInner>, args: ResolveArgs) -> Result<Value, HarnessError> {
    let record = {
        let registry = inner.registry.lock().expect("registry mutex");
        registry
            .get(args.agent_id)
            .cloned()
            .ok_or(ProtocolError::UnknownAgent { agent_id: args.agent_id })?
    };

    let store = WorkspaceStore::open(&record.project_dir, &record.spec_slug, &record.spec_hash);
    let engine = CheckpointEngine::new(store);
    let resolved = engine.resolve(
        &args.checkpoint_id,
        args.verdict,
        args.modifications,
        args.human_notes,
    )?;
    emit(
        inner,
        "checkpoint_resolved",
        args.agent_id,
        serde_json::to_value(&resolved).unwrap_or(Value::Null),
    );

    // A waiting agent resumes: the next session runs the continuation.
    if record.status == AgentStatus::WaitingCheckpoint {
        spawn_session(inner, args.agent_id)?;
    }
    Ok(serde_json::to_value(resolved).unwrap_or(Value::Null))
}

fn emit(inner: &Arc<DaemonInner>, event: &str, agent_id: u64, payload: Value) {
    let _ = inner.events.send(Event {
        event: event.to_string(),
        agent_id,
        payload,
    });
}

fn emit_status(inner: &Arc<DaemonInner>, agent_id: u64) {
    let record = {
        let registry = inner.registry.lock().expect("registry mutex");
        registry.get(agent_id).cloned()
    };
    if let Some(record) = record {
        let payload = serde_json::to_value(&record).unwrap_or(Value::Null);
        emit(inner, "status_changed", agent_id, payload);
    }
}

#[cfg(unix)]
fn signal_session_group(pid: u32, signal: i32) {
    // The session child leads its own process group, so the negative pid
    // reaches the session and its AI subprocess tree.
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

#[cfg(not(unix))]
fn signal_session_group(_pid: u32, _signal: i32) {}

fn canonicalize_utf8(path: &Utf8Path) -> Result<Utf8PathBuf, HarnessError> {
    let canonical = std::fs::canonicalize(path.as_std_path())?;
    Utf8PathBuf::from_path_buf(canonical).map_err(|p| {
        HarnessError::Protocol(ProtocolError::Remote {
            message: format!("project directory is not valid UTF-8: {}", p.display()),
        })
    })
}
