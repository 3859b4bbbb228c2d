//! Session lifecycle management.
//!
//! Tracks all active sessions, handles creation, deletion, quota
//! enforcement, and drain on shutdown. The registry map lock covers map
//! operations only; everything per-session (hub, activity clock, alive
//! flag, PTY handles) lives behind the session's own locks and atomics so
//! unrelated sessions never contend.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use agsh_core::{AgshError, AgshResult};

use super::hub::{BroadcastHub, SubscriberId, Subscription};
use super::pty::PtyProcess;
use crate::workspace::WorkspaceLayout;

/// Bounded queue of pending client→PTY writes per session.
const INPUT_QUEUE_DEPTH: usize = 256;

/// How the agent CLI is launched for every session on this worker.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub initial_rows: u16,
    pub initial_cols: u16,
    /// Pause before injecting `initialCommand`, letting the CLI finish
    /// drawing its first screen.
    pub initial_command_delay: Duration,
}

/// Capacity limits enforced by the registry.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_sessions: usize,
    pub max_sessions_per_owner: usize,
    pub ring_buffer_bytes: usize,
    pub subscriber_queue_depth: usize,
}

/// Caller-supplied parameters for one new session.
#[derive(Debug, Clone, Default)]
pub struct CreateParams {
    pub name: String,
    pub workdir: Option<PathBuf>,
    pub repo_url: Option<String>,
    pub initial_command: Option<String>,
}

/// A live (or recently exited) PTY-backed session.
pub struct Session {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub workdir: PathBuf,
    created_wall: SystemTime,
    created: Instant,
    /// Milliseconds since `created`; advanced with `fetch_max` so the
    /// activity clock only moves forward.
    last_active_ms: AtomicU64,
    alive: AtomicBool,
    exit_code: OnceLock<Option<i32>>,
    torn_down: AtomicBool,
    hub: BroadcastHub,
    pty: PtyProcess,
    input_tx: mpsc::Sender<Vec<u8>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("name", &self.name)
            .field("workdir", &self.workdir)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Record activity now.
    pub fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_active_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the last byte in either direction or the last attach.
    pub fn idle(&self) -> Duration {
        let now = self.created.elapsed().as_millis() as u64;
        let last = self.last_active_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    pub fn uptime(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied().flatten()
    }

    /// Attach a viewer: atomic replay snapshot plus a live feed.
    pub fn attach(&self) -> Subscription {
        self.touch();
        self.hub.subscribe()
    }

    pub fn detach(&self, subscriber: SubscriberId) {
        self.hub.unsubscribe(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    /// Queue client input for the PTY.
    pub async fn write(&self, data: Vec<u8>) -> AgshResult<()> {
        if !self.is_alive() {
            return Err(AgshError::NotFound(self.id.clone()));
        }
        self.touch();
        self.input_tx
            .send(data)
            .await
            .map_err(|_| AgshError::NotFound(self.id.clone()))
    }

    pub fn resize(&self, rows: u16, cols: u16) -> AgshResult<()> {
        if !self.is_alive() {
            return Err(AgshError::NotFound(self.id.clone()));
        }
        self.touch();
        self.pty.resize(rows, cols)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            alive: self.is_alive(),
            idle_seconds: self.idle().as_secs(),
            uptime_seconds: self.uptime().as_secs(),
        }
    }

    pub fn created_at_unix_ms(&self) -> u64 {
        self.created_wall
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    /// Mark the session dead after its process exited on its own.
    fn mark_exited(&self, code: Option<i32>) {
        self.alive.store(false, Ordering::Release);
        let _ = self.exit_code.set(code);
        self.hub.close(code);
    }

    /// Kill the process and disconnect all viewers. Runs at most once.
    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.alive.store(false, Ordering::Release);
        if let Err(e) = self.pty.kill() {
            // Already-exited children report an error here; nothing to do.
            debug!(session_id = %self.id, error = %e, "kill on teardown");
        }
        self.hub.close(self.exit_code());
    }
}

/// Information returned when listing sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub alive: bool,
    pub idle_seconds: u64,
    pub uptime_seconds: u64,
}

/// Owns the session map.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Serializes creates so quota checks and the spawn itself cannot race;
    /// get/list/attach stay on the map lock and are never blocked by a
    /// spawn in flight.
    create_lock: Mutex<()>,
    limits: SessionLimits,
    spawn: SpawnSpec,
    workspaces: WorkspaceLayout,
}

impl SessionRegistry {
    pub fn new(limits: SessionLimits, spawn: SpawnSpec, workspaces: WorkspaceLayout) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            limits,
            spawn,
            workspaces,
        }
    }

    /// Create a session: prepare its working directory, spawn the agent CLI
    /// on a fresh PTY, and start its I/O pumps.
    pub async fn create(&self, owner: &str, params: CreateParams) -> AgshResult<Arc<Session>> {
        let _guard = self.create_lock.lock().await;

        {
            let sessions = self.sessions.read().await;
            let mut total_alive = 0usize;
            let mut owner_alive = 0usize;
            for session in sessions.values() {
                if !session.is_alive() {
                    continue;
                }
                total_alive += 1;
                if session.owner == owner {
                    owner_alive += 1;
                    if session.name == params.name {
                        return Err(AgshError::AlreadyExists(format!(
                            "{owner}/{}",
                            params.name
                        )));
                    }
                }
            }
            if total_alive >= self.limits.max_sessions {
                return Err(AgshError::QuotaExceeded(format!(
                    "worker limit of {} sessions reached",
                    self.limits.max_sessions
                )));
            }
            if owner_alive >= self.limits.max_sessions_per_owner {
                return Err(AgshError::QuotaExceeded(format!(
                    "limit of {} sessions per owner reached",
                    self.limits.max_sessions_per_owner
                )));
            }
        }

        let workdir = self
            .workspaces
            .prepare(
                owner,
                &params.name,
                params.workdir.as_deref(),
                params.repo_url.as_deref(),
            )
            .await?;

        let pty = PtyProcess::spawn(
            &self.spawn.command,
            &self.spawn.args,
            &workdir,
            &self.spawn.env,
            self.spawn.initial_rows,
            self.spawn.initial_cols,
        )?;

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let session = Arc::new(Session {
            id: generate_session_id(),
            owner: owner.to_string(),
            name: params.name.clone(),
            workdir,
            created_wall: SystemTime::now(),
            created: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            exit_code: OnceLock::new(),
            torn_down: AtomicBool::new(false),
            hub: BroadcastHub::new(
                self.limits.ring_buffer_bytes,
                self.limits.subscriber_queue_depth,
            ),
            pty,
            input_tx,
        });

        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());

        spawn_session_pumps(session.clone(), input_rx);

        if let Some(command) = params.initial_command {
            let tx = session.input_tx.clone();
            let delay = self.spawn.initial_command_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut text = command;
                if !text.ends_with('\n') {
                    text.push('\n');
                }
                let _ = tx.send(text.into_bytes()).await;
            });
        }

        info!(
            session_id = %session.id,
            owner,
            name = %params.name,
            workdir = %session.workdir.display(),
            "session created"
        );
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> AgshResult<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AgshError::NotFound(id.to_string()))
    }

    /// All sessions belonging to one owner.
    pub async fn list(&self, owner: &str) -> Vec<SessionSummary> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.owner == owner)
            .map(|s| s.summary())
            .collect()
    }

    /// Kill the process, disconnect all viewers, and drop the entry.
    ///
    /// Idempotent at the API level: a second delete on the same id reports
    /// `NotFound` and frees nothing twice.
    pub async fn delete(&self, id: &str) -> AgshResult<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| AgshError::NotFound(id.to_string()))?;
        session.teardown();
        info!(session_id = %id, "session removed");
        Ok(())
    }

    /// Resize a live session's terminal. Dead or unknown ids are gone.
    pub async fn resize(&self, id: &str, rows: u16, cols: u16) -> AgshResult<()> {
        let session = self.get(id).await?;
        session.resize(rows, cols)
    }

    /// One reaper pass: remove exited sessions, and idle unattended ones
    /// when a threshold is configured. Returns the removed ids.
    pub async fn sweep(&self, idle_threshold: Option<Duration>) -> Vec<String> {
        let mut doomed = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                if !session.is_alive() {
                    doomed.push(id.clone());
                    continue;
                }
                if let Some(threshold) = idle_threshold {
                    if session.subscriber_count() == 0 && session.idle() > threshold {
                        warn!(
                            session_id = %id,
                            idle_secs = session.idle().as_secs(),
                            "session expired (idle)"
                        );
                        doomed.push(id.clone());
                    }
                }
            }
        }
        for id in &doomed {
            let _ = self.delete(id).await;
        }
        if !doomed.is_empty() {
            debug!(count = doomed.len(), "sweep removed sessions");
        }
        doomed
    }

    /// Number of sessions whose process is still running.
    pub async fn active_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_alive())
            .count()
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Drain: kill every session. Called once on server shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        info!(count = drained.len(), "draining sessions");
        for (_, session) in drained {
            session.teardown();
        }
    }
}

/// Start the three per-session tasks: output pump (PTY → hub), input pump
/// (queue → PTY), and exit watcher.
fn spawn_session_pumps(session: Arc<Session>, mut input_rx: mpsc::Receiver<Vec<u8>>) {
    // Output pump: sole reader of the PTY master. Runs until EOF, which the
    // kernel delivers once the child exits or is killed.
    if let Some(mut reader) = session.pty.take_reader() {
        let out = session.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        out.hub.publish(&buf[..n]);
                        out.touch();
                    }
                }
            }
            debug!(session_id = %out.id, "output pump ended");
        });
    }

    // Input pump: owns the write half outright, so it holds no reference to
    // the session and exits when the last input sender is dropped.
    if let Some(mut writer) = session.pty.take_writer() {
        let id = session.id.clone();
        tokio::task::spawn_blocking(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if writer
                    .write_all(&data)
                    .and_then(|()| writer.flush())
                    .is_err()
                {
                    break;
                }
            }
            debug!(session_id = %id, "input pump ended");
        });
    }

    // Exit watcher: resolves once, then fans the exit out to viewers.
    let watched = session;
    tokio::spawn(async move {
        let code = watched.pty.wait().await.ok();
        info!(session_id = %watched.id, code = ?code, "session process exited");
        watched.mark_exited(code);
    });
}

/// Random session id (16 bytes, hex-encoded).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::hub::SessionEvent;
    use std::time::Duration;
    use tokio::time::timeout;

    fn shell_spec() -> SpawnSpec {
        SpawnSpec {
            command: "sh".into(),
            args: Vec::new(),
            env: HashMap::new(),
            initial_rows: 24,
            initial_cols: 80,
            initial_command_delay: Duration::from_millis(50),
        }
    }

    fn test_limits() -> SessionLimits {
        SessionLimits {
            max_sessions: 10,
            max_sessions_per_owner: 2,
            ring_buffer_bytes: 64 * 1024,
            subscriber_queue_depth: 1024,
        }
    }

    fn registry_in(dir: &std::path::Path) -> SessionRegistry {
        SessionRegistry::new(
            test_limits(),
            shell_spec(),
            WorkspaceLayout::new(dir.to_path_buf()),
        )
    }

    /// Read the feed until `needle` shows up in the output.
    async fn await_output(sub: &mut Subscription, needle: &[u8]) -> Vec<u8> {
        let mut seen = sub.snapshot.clone();
        let deadline = Duration::from_secs(10);
        timeout(deadline, async {
            loop {
                if seen
                    .windows(needle.len().max(1))
                    .any(|window| window == needle)
                {
                    return;
                }
                match sub.feed.recv().await {
                    Some(SessionEvent::Output(data)) => seen.extend(data),
                    Some(SessionEvent::Exited { .. }) | None => return,
                }
            }
        })
        .await
        .expect("timed out waiting for output");
        seen
    }

    #[tokio::test]
    async fn create_write_echo_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let session = registry
            .create(
                "alice@example.com",
                CreateParams {
                    name: "demo".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut sub = session.attach();
        session.write(b"echo hi\n".to_vec()).await.unwrap();
        let seen = await_output(&mut sub, b"hi").await;
        assert!(seen.windows(2).any(|w| w == b"hi"));

        registry.delete(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let params = CreateParams {
            name: "demo".into(),
            ..Default::default()
        };
        registry.create("alice", params.clone()).await.unwrap();
        let err = registry.create("alice", params.clone()).await.unwrap_err();
        assert!(matches!(err, AgshError::AlreadyExists(_)));
        // A different owner can reuse the name.
        registry.create("bob", params).await.unwrap();
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn per_owner_quota_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        for i in 0..2 {
            registry
                .create(
                    "alice",
                    CreateParams {
                        name: format!("s{i}"),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let err = registry
            .create(
                "alice",
                CreateParams {
                    name: "s2".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgshError::QuotaExceeded(_)));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let session = registry
            .create(
                "alice",
                CreateParams {
                    name: "demo".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        registry.delete(&session.id).await.unwrap();
        let err = registry.delete(&session.id).await.unwrap_err();
        assert!(matches!(err, AgshError::NotFound(_)));
    }

    #[tokio::test]
    async fn process_exit_notifies_and_blocks_control_ops() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = shell_spec();
        spec.args = vec!["-c".into(), "exit 3".into()];
        let registry = SessionRegistry::new(
            test_limits(),
            spec,
            WorkspaceLayout::new(dir.path().to_path_buf()),
        );
        let session = registry
            .create(
                "alice",
                CreateParams {
                    name: "shortlived".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut sub = session.attach();
        let exited = timeout(Duration::from_secs(10), async {
            loop {
                match sub.feed.recv().await {
                    Some(SessionEvent::Exited { code }) => return code,
                    Some(SessionEvent::Output(_)) => continue,
                    None => return None,
                }
            }
        })
        .await
        .expect("no exit event");
        assert_eq!(exited, Some(3));

        assert!(!session.is_alive());
        let err = registry.resize(&session.id, 40, 120).await.unwrap_err();
        assert!(matches!(err, AgshError::NotFound(_)));

        // The next sweep clears the dead entry.
        let removed = registry.sweep(None).await;
        assert_eq!(removed, vec![session.id.clone()]);
        assert!(matches!(
            registry.get(&session.id).await.unwrap_err(),
            AgshError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn sweep_never_reaps_a_watched_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let session = registry
            .create(
                "alice",
                CreateParams {
                    name: "watched".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Let startup output settle so the idle clock actually advances.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let sub = session.attach();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Idle well past the threshold but attached: survives.
        assert!(registry
            .sweep(Some(Duration::from_millis(1)))
            .await
            .is_empty());

        session.detach(sub.id);
        drop(sub);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Unattended and idle past the threshold: reaped.
        let removed = registry.sweep(Some(Duration::from_millis(1))).await;
        assert_eq!(removed, vec![session.id.clone()]);
    }

    #[tokio::test]
    async fn initial_command_is_injected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let session = registry
            .create(
                "alice",
                CreateParams {
                    name: "kickoff".into(),
                    initial_command: Some("echo started".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut sub = session.attach();
        let seen = await_output(&mut sub, b"started").await;
        assert!(seen.windows(7).any(|w| w == b"started"));
        registry.shutdown().await;
    }
}
