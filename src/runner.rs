//! AI-subprocess runner
//!
//! Spawns the agent subprocess for one session, pipes the rendered prompt to
//! its stdin, streams stdout/stderr line by line into the session log, and
//! terminates the whole process group on stop: SIGTERM, a grace window, then
//! SIGKILL.
//!
//! All execution is argv-style. Arguments cross the boundary as discrete
//! elements; no shell string is ever evaluated.

use camino::{Utf8Path, Utf8PathBuf};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::watch;

use crate::error::RunnerError;
use crate::store::WorkspaceStore;

/// Default grace window between SIGTERM and SIGKILL on stop.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(30);

/// Bytes of stderr retained for failure diagnostics.
const STDERR_TAIL_CAP: usize = 2048;

/// Specification for a command to execute, argv-style.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<Utf8PathBuf>,
    pub env: Vec<(OsString, OsString)>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn to_tokio_command(&self) -> TokioCommand {
        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// How a session subprocess ended.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Exit code, `None` when killed by signal
    pub exit_code: Option<i32>,
    /// True when the stop channel requested termination
    pub stopped: bool,
    /// Last bytes of stderr, for diagnostics
    pub stderr_tail: String,
}

impl SessionOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.stopped
    }
}

/// Bounded tail of a byte stream, kept line-oriented.
#[derive(Debug, Default)]
struct TailBuffer {
    lines: VecDeque<String>,
    bytes: usize,
}

impl TailBuffer {
    fn push(&mut self, line: &str) {
        self.lines.push_back(line.to_string());
        self.bytes += line.len() + 1;
        while self.bytes > STDERR_TAIL_CAP {
            match self.lines.pop_front() {
                Some(dropped) => self.bytes -= dropped.len() + 1,
                None => break,
            }
        }
    }

    fn into_string(self) -> String {
        let mut out = String::with_capacity(self.bytes);
        for line in self.lines {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

/// Run one agent subprocess to completion, streaming its output to the
/// session log. Returns when the process exits, including after a stop
/// request has escalated from SIGTERM to SIGKILL.
pub async fn run_streaming(
    spec: &CommandSpec,
    prompt: &str,
    log_path: &Utf8Path,
    mut stop_rx: watch::Receiver<bool>,
    grace: Duration,
) -> Result<SessionOutcome, RunnerError> {
    let mut cmd = spec.to_tokio_command();
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| RunnerError::Spawn {
        program: spec.program.to_string_lossy().into_owned(),
        source: e,
    })?;
    let child_pid = child.id();

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(prompt.as_bytes())
            .await
            .map_err(|e| RunnerError::Stream { source: e })?;
        drop(stdin);
    }

    let stdout = child.stdout.take().ok_or_else(|| RunnerError::Stream {
        source: std::io::Error::other("failed to capture stdout"),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| RunnerError::Stream {
        source: std::io::Error::other("failed to capture stderr"),
    })?;
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();

    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut stopped = false;
    let mut stop_armed = true;
    let mut tail = TailBuffer::default();

    while !(stdout_done && stderr_done) {
        tokio::select! {
            line = out_lines.next_line(), if !stdout_done => match line {
                Ok(Some(line)) => {
                    let _ = WorkspaceStore::append_log(log_path, &line);
                }
                Ok(None) => stdout_done = true,
                Err(e) => return Err(RunnerError::Stream { source: e }),
            },
            line = err_lines.next_line(), if !stderr_done => match line {
                Ok(Some(line)) => {
                    tail.push(&line);
                    let _ = WorkspaceStore::append_log(log_path, &format!("stderr: {line}"));
                }
                Ok(None) => stderr_done = true,
                Err(e) => return Err(RunnerError::Stream { source: e }),
            },
            changed = stop_rx.changed(), if stop_armed && !stopped => {
                match changed {
                    Ok(()) if *stop_rx.borrow() => {
                        stopped = true;
                        let _ = WorkspaceStore::append_log(log_path, "stop requested, terminating agent subprocess");
                        begin_termination(child_pid, grace);
                    }
                    Ok(()) => {}
                    // Sender dropped: no stop can arrive on this channel.
                    Err(_) => stop_armed = false,
                }
            },
        }
    }

    let status = child.wait().await.map_err(|e| RunnerError::Stream { source: e })?;

    Ok(SessionOutcome {
        exit_code: status.code(),
        stopped,
        stderr_tail: tail.into_string(),
    })
}

/// Send SIGTERM to the subprocess now and SIGKILL after the grace window if
/// it is still alive. The subprocess shares the session's process group, so
/// the daemon's group-level kill remains the backstop for stray children.
fn begin_termination(child_pid: Option<u32>, grace: Duration) {
    let Some(pid) = child_pid else {
        return;
    };
    signal_pid(pid, libc::SIGTERM);
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        signal_pid(pid, libc::SIGKILL);
    });
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: i32) {
    // Errors are expected when the process already exited.
    unsafe {
        libc::kill(pid as i32, signal);
    }
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _signal: i32) {}
