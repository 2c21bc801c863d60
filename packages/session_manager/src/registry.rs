//! Session Registry
//!
//! Maps caller-supplied session ids to the one current process instance for
//! that id, and owns creation, resume and teardown ordering.
//!
//! ## Concurrency
//!
//! - The session map sits behind an async mutex. Instance-id checks, detector
//!   updates and outward event emission all happen while it is held, so an
//!   event from a superseded instance can never be delivered once a newer
//!   instance is registered.
//! - Caller-driven lifecycle transitions (`create`, `kill`, `shutdown_all`)
//!   are serialized by a second mutex, the lifecycle gate.
//! - Each instance owns an output pump task, an exit watcher task and a
//!   one-shot detection-enable timer.
//!
//! ## Teardown order
//!
//! 1. cancel the detection-enable timer
//! 2. kill the process
//! 3. wait (bounded by the grace period) for the exit acknowledgment and for
//!    the output pump to drain; escalate to a forced kill if the process is
//!    still alive afterwards
//! 4. dispose both listeners
//! 5. remove the entry from the map
//!
//! No step can prevent the next one from running.

use chrono::{DateTime, Utc};
use pty_manager::{PtyConfig, PtyOutput};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::credentials::CredentialMaterializer;
use crate::detector::FailureDetector;
use crate::error::SessionError;
use crate::events::{InstanceId, SessionEvent};
use crate::file_queue::FileOpQueue;
use crate::pipeline::OutputPipeline;
use crate::process::{LaunchedProcess, ProcessLauncher, SessionProcess, default_shell};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const MAX_SESSION_ID_LEN: usize = 128;

/// Launch parameters for `create`
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub shell: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// May carry reserved credential keys; those are consumed, never inherited
    pub env: BTreeMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            shell: None,
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            cols: 80,
            rows: 24,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreateOutcome {
    pub instance_id: InstanceId,
    /// An instance with the same id was torn down first
    pub resumed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Terminating,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub instance_id: InstanceId,
    pub state: SessionState,
    pub shell: String,
    pub cwd: PathBuf,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub credential_dir: Option<PathBuf>,
    pub detection_enabled: bool,
    pub failure_detected: bool,
}

/// What `kill` hands back: the credential directory is now the caller's
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosedSession {
    pub id: String,
    pub instance_id: InstanceId,
    pub credential_dir: Option<PathBuf>,
}

/// The two listener tasks attached to a process's event streams
struct SessionListeners {
    output: JoinHandle<()>,
    exit: JoinHandle<()>,
}

impl SessionListeners {
    /// Consumes self: listeners are disposed exactly once
    fn dispose(self) {
        self.output.abort();
        self.exit.abort();
    }
}

/// Resources moved out of an entry when its teardown starts
struct SessionResources {
    enable_timer: JoinHandle<()>,
    listeners: SessionListeners,
    exit: watch::Receiver<Option<i32>>,
}

struct Teardown {
    id: String,
    instance_id: InstanceId,
    process: Arc<dyn SessionProcess>,
    resources: SessionResources,
}

struct SessionEntry {
    instance_id: InstanceId,
    state: SessionState,
    shell: String,
    cwd: PathBuf,
    created_at: DateTime<Utc>,
    credential_dir: Option<PathBuf>,
    process: Arc<dyn SessionProcess>,
    pipeline: OutputPipeline,
    /// `None` once teardown has started
    resources: Option<SessionResources>,
}

impl SessionEntry {
    fn begin_teardown(&mut self, id: &str) -> Option<Teardown> {
        let resources = self.resources.take()?;
        self.state = SessionState::Terminating;
        Some(Teardown {
            id: id.to_string(),
            instance_id: self.instance_id,
            process: self.process.clone(),
            resources,
        })
    }

    fn info(&self, id: &str) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            instance_id: self.instance_id,
            state: self.state,
            shell: self.shell.clone(),
            cwd: self.cwd.clone(),
            pid: self.process.pid(),
            created_at: self.created_at,
            credential_dir: self.credential_dir.clone(),
            detection_enabled: self.pipeline.detector().is_enabled(),
            failure_detected: self.pipeline.detector().is_detected(),
        }
    }
}

/// Outcome of claiming an entry for teardown
enum Claim {
    Teardown(Teardown),
    /// The entry was already being torn down after a natural exit; it has
    /// been dropped from the map directly
    Removed(ClosedSession),
}

/// State shared with per-session tasks
struct Shared {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    events: broadcast::Sender<SessionEvent>,
    config: SessionConfig,
}

pub struct SessionRegistry {
    shared: Arc<Shared>,
    lifecycle: Mutex<()>,
    next_instance: AtomicU64,
    launcher: Arc<dyn ProcessLauncher>,
    materializer: CredentialMaterializer,
}

impl SessionRegistry {
    /// Must be called from within a tokio runtime.
    pub fn new(config: SessionConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let queue = Arc::new(FileOpQueue::new(config.file_op_timeout));
        let materializer = CredentialMaterializer::new(queue, config.credentials.clone());

        Self {
            shared: Arc::new(Shared {
                sessions: Mutex::new(HashMap::new()),
                events,
                config,
            }),
            lifecycle: Mutex::new(()),
            next_instance: AtomicU64::new(1),
            launcher,
            materializer,
        }
    }

    /// Subscribe to output, exit, credential-failure and close events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Create (or resume) the session `id`.
    ///
    /// An existing instance with the same id is torn down first and does not
    /// count against the session cap.
    pub async fn create(&self, id: &str, spec: LaunchSpec) -> Result<CreateOutcome, SessionError> {
        validate_session_id(id)?;
        let _gate = self.lifecycle.lock().await;

        let previous = {
            let mut sessions = self.shared.sessions.lock().await;
            match Shared::claim(&mut sessions, &self.shared.events, id) {
                Some(claim) => Some(claim),
                None => {
                    let active = sessions
                        .values()
                        .filter(|e| e.state == SessionState::Active)
                        .count();
                    let max = self.shared.config.max_sessions;
                    if active >= max {
                        warn!("Rejecting session {}: {} of {} sessions active", id, active, max);
                        return Err(SessionError::Capacity { max });
                    }
                    None
                }
            }
        };

        let resumed = previous.is_some();
        if let Some(claim) = previous {
            info!("Resuming session {}: tearing down previous instance", id);
            self.shared.resolve(claim, None).await;
        }

        let mut env = spec.env;
        let credentials = self.materializer.materialize(id, &mut env).await?;

        let shell = spec
            .shell
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.shared.config.default_shell.clone())
            .unwrap_or_else(default_shell);
        let cwd = spec
            .cwd
            .unwrap_or_else(|| self.shared.config.default_cwd.clone());

        let launched = self
            .launcher
            .launch(PtyConfig {
                command: shell.clone(),
                args: spec.args,
                working_dir: Some(cwd.to_string_lossy().to_string()),
                env: env.into_iter().collect(),
                rows: spec.rows,
                cols: spec.cols,
            })
            .map_err(|e| {
                error!("Failed to spawn session {} ('{}'): {}", id, shell, e);
                SessionError::Spawn(e)
            })?;

        let instance_id = InstanceId(self.next_instance.fetch_add(1, Ordering::SeqCst));
        self.shared
            .register(
                id,
                instance_id,
                launched,
                shell,
                cwd,
                credentials.map(|c| c.dir),
            )
            .await;

        info!("Session {} started as instance {} (resumed: {})", id, instance_id, resumed);
        Ok(CreateOutcome {
            instance_id,
            resumed,
        })
    }

    /// Forward input to the session's process. Returns false (and does
    /// nothing) when `id` is not an active session.
    pub async fn input(&self, id: &str, text: &str) -> bool {
        let process = {
            let mut sessions = self.shared.sessions.lock().await;
            match sessions.get_mut(id) {
                Some(entry) if entry.state == SessionState::Active => {
                    entry.pipeline.observe_input(Instant::now(), text);
                    entry.process.clone()
                }
                _ => {
                    debug!("Input for unknown session {} dropped", id);
                    return false;
                }
            }
        };

        if let Err(e) = process.write(text.as_bytes()).await {
            warn!("Failed to write input to session {}: {}", id, e);
        }
        true
    }

    /// Resize the session's terminal. Failures are logged, never returned.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) {
        let process = {
            let sessions = self.shared.sessions.lock().await;
            match sessions.get(id) {
                Some(entry) if entry.state == SessionState::Active => entry.process.clone(),
                _ => {
                    debug!("Resize for unknown session {} dropped", id);
                    return;
                }
            }
        };

        if let Err(e) = process.resize(cols, rows).await {
            warn!("Failed to resize session {} to {}x{}: {}", id, cols, rows, e);
        }
    }

    /// Tear down and remove `id`. Returns `None` if it was not registered.
    pub async fn kill(&self, id: &str) -> Option<ClosedSession> {
        let _gate = self.lifecycle.lock().await;

        let claim = {
            let mut sessions = self.shared.sessions.lock().await;
            Shared::claim(&mut sessions, &self.shared.events, id)
        };

        match claim {
            Some(claim) => {
                info!("Killing session {}", id);
                self.shared.resolve(claim, None).await
            }
            None => {
                debug!("Kill for unknown session {} ignored", id);
                None
            }
        }
    }

    /// Tear down every session and clear the registry
    pub async fn shutdown_all(&self) {
        let _gate = self.lifecycle.lock().await;

        let claims: Vec<Claim> = {
            let mut sessions = self.shared.sessions.lock().await;
            let ids: Vec<String> = sessions.keys().cloned().collect();
            ids.iter()
                .filter_map(|id| Shared::claim(&mut sessions, &self.shared.events, id))
                .collect()
        };

        info!("Shutting down {} session(s)", claims.len());
        futures::future::join_all(claims.into_iter().map(|claim| self.shared.resolve(claim, None)))
            .await;

        let mut sessions = self.shared.sessions.lock().await;
        for (id, entry) in sessions.drain() {
            let _ = self.shared.events.send(SessionEvent::Closed {
                id,
                instance_id: entry.instance_id,
                credential_dir: entry.credential_dir,
            });
        }
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.shared.sessions.lock().await;
        let mut list: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| entry.info(id))
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub async fn get(&self, id: &str) -> Option<SessionInfo> {
        let sessions = self.shared.sessions.lock().await;
        sessions.get(id).map(|entry| entry.info(id))
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.shared.sessions.lock().await.contains_key(id)
    }

    /// Replay of recent display text, at most `max_bytes`
    pub async fn recent_output(&self, id: &str, max_bytes: usize) -> Option<String> {
        let sessions = self.shared.sessions.lock().await;
        sessions
            .get(id)
            .map(|entry| entry.pipeline.recent_output(max_bytes))
    }
}

impl Shared {
    fn claim(
        sessions: &mut HashMap<String, SessionEntry>,
        events: &broadcast::Sender<SessionEvent>,
        id: &str,
    ) -> Option<Claim> {
        let entry = sessions.get_mut(id)?;
        if let Some(teardown) = entry.begin_teardown(id) {
            return Some(Claim::Teardown(teardown));
        }
        let entry = sessions.remove(id)?;
        let closed = ClosedSession {
            id: id.to_string(),
            instance_id: entry.instance_id,
            credential_dir: entry.credential_dir,
        };
        let _ = events.send(SessionEvent::Closed {
            id: closed.id.clone(),
            instance_id: closed.instance_id,
            credential_dir: closed.credential_dir.clone(),
        });
        Some(Claim::Removed(closed))
    }

    async fn resolve(&self, claim: Claim, exit_code: Option<i32>) -> Option<ClosedSession> {
        match claim {
            Claim::Teardown(teardown) => self.finish_teardown(teardown, exit_code).await,
            Claim::Removed(closed) => Some(closed),
        }
    }

    async fn register(
        self: &Arc<Self>,
        id: &str,
        instance_id: InstanceId,
        launched: LaunchedProcess,
        shell: String,
        cwd: PathBuf,
        credential_dir: Option<PathBuf>,
    ) {
        let LaunchedProcess {
            process,
            output,
            exit,
        } = launched;

        let detector = FailureDetector::new(
            self.config.patterns.clone(),
            self.config.detection.clone(),
            Instant::now(),
        );
        let pipeline = OutputPipeline::new(detector, self.config.replay_buffer_bytes);

        // Hold the map lock while spawning so no task observes a missing entry
        let mut sessions = self.sessions.lock().await;

        let listeners = SessionListeners {
            output: tokio::spawn(pump_output(self.clone(), id.to_string(), instance_id, output)),
            exit: tokio::spawn(watch_exit(self.clone(), id.to_string(), instance_id, exit.clone())),
        };
        let enable_timer = tokio::spawn(enable_detection_after(
            self.clone(),
            id.to_string(),
            instance_id,
        ));

        sessions.insert(
            id.to_string(),
            SessionEntry {
                instance_id,
                state: SessionState::Active,
                shell,
                cwd,
                created_at: Utc::now(),
                credential_dir,
                process,
                pipeline,
                resources: Some(SessionResources {
                    enable_timer,
                    listeners,
                    exit,
                }),
            },
        );
    }

    /// Steps 1-5 of teardown. `exit_code` is set when the process exited on
    /// its own, in which case an exit event is reported once output drained.
    async fn finish_teardown(&self, teardown: Teardown, exit_code: Option<i32>) -> Option<ClosedSession> {
        let Teardown {
            id,
            instance_id,
            process,
            resources,
        } = teardown;
        let SessionResources {
            enable_timer,
            mut listeners,
            mut exit,
        } = resources;

        // 1.
        enable_timer.abort();

        // 2.
        if let Err(e) = process.kill().await {
            warn!("Session {} {}: kill failed: {}", id, instance_id, e);
        }

        // 3.
        let grace = self.config.teardown_grace;
        let drained = tokio::time::timeout(grace, async {
            let _ = exit.wait_for(Option::is_some).await;
            let _ = (&mut listeners.output).await;
        })
        .await
        .is_ok();
        if !drained {
            debug!(
                "Session {} {}: not drained after {:?}",
                id, instance_id, grace
            );
            if exit.borrow().is_none() {
                if let Err(e) = process.force_kill().await {
                    warn!("Session {} {}: forced kill failed: {}", id, instance_id, e);
                }
            }
        }

        if let Some(code) = exit_code {
            let sessions = self.sessions.lock().await;
            if current(&sessions, &id, instance_id).is_some() {
                let _ = self.events.send(SessionEvent::Exit {
                    id: id.clone(),
                    code,
                });
            }
        }

        // 4.
        listeners.dispose();

        // 5.
        let mut sessions = self.sessions.lock().await;
        if current(&sessions, &id, instance_id).is_none() {
            debug!("Session {} {}: superseded before removal", id, instance_id);
            return None;
        }
        let entry = sessions.remove(&id)?;
        info!("Session {} {} removed", id, instance_id);
        let closed = ClosedSession {
            id,
            instance_id,
            credential_dir: entry.credential_dir,
        };
        let _ = self.events.send(SessionEvent::Closed {
            id: closed.id.clone(),
            instance_id,
            credential_dir: closed.credential_dir.clone(),
        });
        Some(closed)
    }

    /// Run one output chunk through the session's pipeline. Returns false
    /// when the instance is no longer current.
    async fn handle_output(&self, id: &str, instance_id: InstanceId, data: &[u8]) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(entry) = current_mut(&mut sessions, id, instance_id) else {
            return false;
        };

        let processed = entry.pipeline.process(Instant::now(), data);
        if !processed.display.is_empty() {
            let _ = self.events.send(SessionEvent::Output {
                id: id.to_string(),
                text: processed.display,
            });
        }
        if let Some(failure) = processed.failure {
            info!(
                "Session {} {}: credential failure detected ({}: {})",
                id, instance_id, failure.pattern, failure.reason
            );
            let _ = self.events.send(SessionEvent::CredentialFailed {
                id: id.to_string(),
                reason: failure.reason,
            });
        }
        true
    }

    async fn enable_detection(&self, id: &str, instance_id: InstanceId) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = current_mut(&mut sessions, id, instance_id) {
            if entry.pipeline.enable_detection(Instant::now()) {
                debug!("Session {} {}: failure detection enabled", id, instance_id);
            }
        }
    }

    async fn on_process_exit(self: &Arc<Self>, id: &str, instance_id: InstanceId, code: i32) {
        let teardown = {
            let mut sessions = self.sessions.lock().await;
            match current_mut(&mut sessions, id, instance_id) {
                Some(entry) => entry.begin_teardown(id),
                None => {
                    debug!("Exit of stale instance {} of session {} ignored", instance_id, id);
                    None
                }
            }
        };

        if let Some(teardown) = teardown {
            info!("Session {} {} exited with code {}", id, instance_id, code);
            // Teardown disposes this task's own listener, so it must run elsewhere
            let shared = self.clone();
            tokio::spawn(async move {
                shared.finish_teardown(teardown, Some(code)).await;
            });
        }
    }
}

fn current<'a>(
    sessions: &'a HashMap<String, SessionEntry>,
    id: &str,
    instance_id: InstanceId,
) -> Option<&'a SessionEntry> {
    sessions.get(id).filter(|e| e.instance_id == instance_id)
}

fn current_mut<'a>(
    sessions: &'a mut HashMap<String, SessionEntry>,
    id: &str,
    instance_id: InstanceId,
) -> Option<&'a mut SessionEntry> {
    sessions.get_mut(id).filter(|e| e.instance_id == instance_id)
}

async fn pump_output(
    shared: Arc<Shared>,
    id: String,
    instance_id: InstanceId,
    mut output: broadcast::Receiver<PtyOutput>,
) {
    loop {
        let chunk = match output.recv().await {
            Ok(chunk) => chunk,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Session {} {}: output lagged, {} chunk(s) dropped", id, instance_id, skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if !shared.handle_output(&id, instance_id, &chunk.data).await {
            debug!("Session {} {}: discarding output of stale instance", id, instance_id);
            break;
        }
    }
    debug!("Session {} {}: output stream ended", id, instance_id);
}

async fn watch_exit(
    shared: Arc<Shared>,
    id: String,
    instance_id: InstanceId,
    mut exit: watch::Receiver<Option<i32>>,
) {
    let code = match exit.wait_for(Option::is_some).await {
        Ok(code) => code.unwrap_or(-1),
        Err(_) => -1,
    };
    shared.on_process_exit(&id, instance_id, code).await;
}

async fn enable_detection_after(shared: Arc<Shared>, id: String, instance_id: InstanceId) {
    tokio::time::sleep(shared.config.detection.enable_delay).await;
    shared.enable_detection(&id, instance_id).await;
}

/// Session ids name a directory on disk, so keep them to a single path component
pub fn validate_session_id(id: &str) -> Result<(), SessionError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidId(id.to_string()))
    }
}
