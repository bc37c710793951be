//! Daemon lifecycle over the real socket: full runs, stop semantics, and
//! registry durability across daemon restarts.

use std::time::Duration;

use camino::Utf8PathBuf;
use tokio::task::JoinHandle;

use overseer::checkpoint::CheckpointEngine;
use overseer::daemon::{Daemon, DaemonClient, DaemonConfig, StartArgs};
use overseer::store::WorkspaceStore;
use overseer::types::{AgentStatus, CheckpointKind, ModeFlags, Phase, Verdict};

const SPEC_TEXT: &str = "Build a small todo application: an add command, a list command, and a \
complete command. State persists to a local JSON file between invocations.";

struct DaemonFixture {
    _runtime: tempfile::TempDir,
    _project: tempfile::TempDir,
    config: DaemonConfig,
    project_dir: Utf8PathBuf,
    spec_file: Utf8PathBuf,
    handle: Option<JoinHandle<()>>,
}

impl DaemonFixture {
    fn new(agent_args: &[&str]) -> Self {
        let runtime = tempfile::TempDir::new().unwrap();
        let project = tempfile::TempDir::new().unwrap();
        let runtime_dir = Utf8PathBuf::from_path_buf(runtime.path().to_path_buf()).unwrap();
        let project_dir = Utf8PathBuf::from_path_buf(project.path().to_path_buf()).unwrap();

        let spec_file = project_dir.join("todo-app.txt");
        std::fs::write(spec_file.as_std_path(), SPEC_TEXT).unwrap();

        let config = DaemonConfig {
            socket_path: runtime_dir.join("daemon.sock"),
            pid_path: runtime_dir.join("daemon.pid"),
            registry_path: runtime_dir.join("registry.json"),
            session_program: Utf8PathBuf::from(env!("CARGO_BIN_EXE_overseer")),
            agent_program: env!("CARGO_BIN_EXE_agent-stub").to_string(),
            agent_args: agent_args.iter().map(ToString::to_string).collect(),
            templates_dir: None,
            stop_grace: Duration::from_secs(1),
            respawn_delay: Duration::from_millis(50),
        };

        Self {
            _runtime: runtime,
            _project: project,
            config,
            project_dir,
            spec_file,
            handle: None,
        }
    }

    fn spawn_daemon(&mut self) {
        let daemon = Daemon::new(self.config.clone()).unwrap();
        self.handle = Some(tokio::spawn(async move {
            daemon.run().await.expect("daemon run failed");
        }));
    }

    async fn client(&self) -> DaemonClient {
        for _ in 0..100 {
            if let Ok(client) = DaemonClient::connect(&self.config.socket_path).await {
                return client;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("daemon socket never came up");
    }

    async fn shutdown(&mut self) {
        let mut client = self.client().await;
        let _ = client.shutdown().await;
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
        }
    }

    fn start_args(&self, auto_accept: bool) -> StartArgs {
        StartArgs {
            project_dir: self.project_dir.clone(),
            spec_file: self.spec_file.clone(),
            target_branch: "main".into(),
            auto_accept,
            mode_flags: ModeFlags::default(),
        }
    }

    fn workspace(&self, slug: &str, hash: &str) -> WorkspaceStore {
        WorkspaceStore::open(&self.project_dir, slug, hash)
    }
}

async fn poll_status(
    client: &mut DaemonClient,
    agent_id: u64,
    want: AgentStatus,
    timeout: Duration,
) -> overseer::types::AgentRecord {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let record = client.status(agent_id).await.unwrap();
        if record.status == want {
            return record;
        }
        assert!(
            record.status != AgentStatus::Failed || want == AgentStatus::Failed,
            "agent failed while waiting for {want}: {:?}",
            record.last_error
        );
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {want}; currently {} ({:?})",
            record.status,
            record.last_error
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_accept_agent_runs_to_done_under_the_daemon() {
    let mut fx = DaemonFixture::new(&["--issues", "2"]);
    fx.spawn_daemon();
    let mut client = fx.client().await;

    assert!(client.ping().await.unwrap());
    let record = client.start(fx.start_args(true)).await.unwrap();
    assert_eq!(record.status, AgentStatus::Running);

    let done = poll_status(&mut client, record.agent_id, AgentStatus::Done, Duration::from_secs(120)).await;
    assert_eq!(done.phase, Phase::Done);

    let listed = client.list().await.unwrap();
    assert_eq!(listed.len(), 1);

    let milestone = fx.workspace(&done.spec_slug, &done.spec_hash).milestone().unwrap();
    assert!(milestone.all_issues_closed);
    assert!(milestone.merge_request_url.is_some());

    client.remove(record.agent_id).await.unwrap();
    assert!(client.list().await.unwrap().is_empty());

    fx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_live_runs_are_refused() {
    let mut fx = DaemonFixture::new(&[]);
    fx.spawn_daemon();
    let mut client = fx.client().await;

    let record = client.start(fx.start_args(false)).await.unwrap();
    poll_status(&mut client, record.agent_id, AgentStatus::WaitingCheckpoint, Duration::from_secs(30)).await;

    let err = client.start(fx.start_args(false)).await.unwrap_err();
    assert!(err.to_string().contains("running agent already exists"), "got: {err}");

    fx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_reaches_a_terminal_status_for_a_hung_agent() {
    let mut fx = DaemonFixture::new(&["--scenario", "hang"]);
    fx.spawn_daemon();
    let mut client = fx.client().await;

    let record = client.start(fx.start_args(false)).await.unwrap();
    // Give the session a moment to spawn the hung subprocess.
    tokio::time::sleep(Duration::from_millis(500)).await;

    client.stop(record.agent_id).await.unwrap();
    let stopped =
        poll_status(&mut client, record.agent_id, AgentStatus::Stopped, Duration::from_secs(30)).await;
    assert!(stopped.pid.is_none());

    // Stop is idempotent.
    let again = client.stop(record.agent_id).await.unwrap();
    assert_eq!(again.status, AgentStatus::Stopped);

    fx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn registry_survives_a_daemon_restart_mid_wait() {
    let mut fx = DaemonFixture::new(&[]);
    fx.spawn_daemon();
    let mut client = fx.client().await;

    let record = client.start(fx.start_args(false)).await.unwrap();
    let waiting = poll_status(
        &mut client,
        record.agent_id,
        AgentStatus::WaitingCheckpoint,
        Duration::from_secs(30),
    )
    .await;

    // Kill the daemon while the agent waits on a human.
    fx.shutdown().await;

    // A fresh daemon reloads the same registry and still knows the agent.
    fx.spawn_daemon();
    let mut client = fx.client().await;
    let reloaded = client.status(record.agent_id).await.unwrap();
    assert_eq!(reloaded.status, AgentStatus::WaitingCheckpoint);
    assert_eq!(reloaded.spec_slug, waiting.spec_slug);

    // Resolving the checkpoint resumes the run: the continuation executes and
    // the next gate appears.
    let store = fx.workspace(&reloaded.spec_slug, &reloaded.spec_hash);
    let engine = CheckpointEngine::new(store.clone());
    let pending = engine.load_pending(None).unwrap().unwrap();
    assert_eq!(pending.kind, CheckpointKind::ProjectVerification);

    client
        .resolve_checkpoint(record.agent_id, &pending.checkpoint_id, Verdict::Approved, None, None)
        .await
        .unwrap();

    poll_status(
        &mut client,
        record.agent_id,
        AgentStatus::WaitingCheckpoint,
        Duration::from_secs(30),
    )
    .await;
    let next = engine.load_pending(None).unwrap().unwrap();
    assert_eq!(next.kind, CheckpointKind::SpecToIssues);
    assert!(store.milestone_exists(), "continuation ran after resume");
    assert!(
        engine
            .log()
            .unwrap()
            .find(&pending.checkpoint_id)
            .unwrap()
            .completed
    );

    fx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_resolvers_race_on_the_status_field() {
    let mut fx = DaemonFixture::new(&[]);
    fx.spawn_daemon();
    let mut client = fx.client().await;

    let record = client.start(fx.start_args(false)).await.unwrap();
    poll_status(&mut client, record.agent_id, AgentStatus::WaitingCheckpoint, Duration::from_secs(30)).await;

    let store = fx.workspace(&record.spec_slug, &record.spec_hash);
    let engine = CheckpointEngine::new(store);
    let pending = engine.load_pending(None).unwrap().unwrap();

    let mut second = fx.client().await;
    let first = client
        .resolve_checkpoint(record.agent_id, &pending.checkpoint_id, Verdict::Approved, None, None)
        .await;
    let racer = second
        .resolve_checkpoint(
            record.agent_id,
            &pending.checkpoint_id,
            Verdict::Rejected,
            None,
            Some("too late".to_string()),
        )
        .await;

    assert!(first.is_ok());
    let err = racer.unwrap_err();
    assert!(err.to_string().contains("already approved"), "got: {err}");

    fx.shutdown().await;
}
