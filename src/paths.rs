use camino::Utf8PathBuf;
use std::cell::RefCell;

/// Directory under the project root that holds all per-run state.
pub const AGENT_STATE_DIR: &str = ".claude-agent";

// Thread-local override used only in tests to avoid process-global env races.
thread_local! {
    static THREAD_RUNTIME: RefCell<Option<Utf8PathBuf>> = const { RefCell::new(None) };
}

/// Per-run workspace directory: `<project_dir>/.claude-agent/<spec_slug>-<spec_hash>`.
#[must_use]
pub fn workspace_dir(project_dir: &camino::Utf8Path, spec_slug: &str, spec_hash: &str) -> Utf8PathBuf {
    project_dir
        .join(AGENT_STATE_DIR)
        .join(format!("{spec_slug}-{spec_hash}"))
}

/// Resolve the daemon runtime directory:
/// 1) thread-local override (tests use this)
/// 2) env `OVERSEER_RUNTIME_DIR` (opt-in for users/CI)
/// 3) `$XDG_RUNTIME_DIR/overseer`
/// 4) fallback `/tmp/overseer-<uid>`
#[must_use]
pub fn runtime_dir() -> Utf8PathBuf {
    if let Some(tl) = THREAD_RUNTIME.with(|tl| tl.borrow().clone()) {
        return tl;
    }
    if let Ok(p) = std::env::var("OVERSEER_RUNTIME_DIR") {
        return Utf8PathBuf::from(p);
    }
    if let Ok(p) = std::env::var("XDG_RUNTIME_DIR") {
        return Utf8PathBuf::from(p).join("overseer");
    }
    let uid = unsafe { libc::getuid() };
    Utf8PathBuf::from(format!("/tmp/overseer-{uid}"))
}

/// Returns `<runtime_dir>/daemon.sock`
#[must_use]
pub fn daemon_socket() -> Utf8PathBuf {
    runtime_dir().join("daemon.sock")
}

/// Returns `<runtime_dir>/daemon.pid`
#[must_use]
pub fn daemon_pid_file() -> Utf8PathBuf {
    runtime_dir().join("daemon.pid")
}

/// Returns `<runtime_dir>/registry.json`
///
/// The registry lives next to the socket so an isolated runtime dir isolates
/// everything a daemon instance touches.
#[must_use]
pub fn daemon_registry() -> Utf8PathBuf {
    runtime_dir().join("registry.json")
}

/// mkdir -p; treat `AlreadyExists` as success (removes TOCTTOU races)
pub fn ensure_dir_all<P: AsRef<std::path::Path>>(p: P) -> std::io::Result<()> {
    match std::fs::create_dir_all(&p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Test helper: give this test a unique runtime dir under the system temp dir.
/// Hold the `TempDir` for the test's duration so the directory stays alive.
#[cfg(any(test, feature = "test-utils"))]
#[cfg_attr(not(test), allow(dead_code))]
#[must_use]
pub fn with_isolated_runtime() -> tempfile::TempDir {
    let td = tempfile::TempDir::new().expect("create temp runtime dir");
    let p = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
    THREAD_RUNTIME.with(|tl| *tl.borrow_mut() = Some(p));
    td
}
