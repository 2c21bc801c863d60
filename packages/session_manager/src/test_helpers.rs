use async_trait::async_trait;
use pty_manager::{PtyConfig, PtyError, PtyOutput};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::config::{FileConfig, SessionConfig};
use crate::events::SessionEvent;
use crate::process::{LaunchedProcess, ProcessLauncher, SessionProcess};

/// Runtime config with defaults, rooted in `root` instead of the cwd.
pub fn test_config(root: &Path) -> SessionConfig {
    let mut config = SessionConfig::from_file(&FileConfig::default()).expect("default config");
    config.default_cwd = root.to_path_buf();
    config.credentials.root = root.join(".sessions");
    config
}

/// Let spawned tasks run. Under paused time the clock only moves once every
/// task is idle, so this also drains pending work.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Everything currently buffered on an event receiver
pub fn drain_events(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FakeMode {
    Normal,
    Failing,
    IgnoreSigterm,
}

/// Launcher that hands out scripted processes.
///
/// Every lifecycle call is appended to a shared log (`spawn p1`, `kill p1`,
/// `force_kill p1`) so tests can assert on ordering across instances.
pub struct FakeLauncher {
    mode: FakeMode,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::with_mode(FakeMode::Normal)
    }
}

impl FakeLauncher {
    /// Every launch fails like a missing executable
    pub fn failing() -> Self {
        Self::with_mode(FakeMode::Failing)
    }

    /// Processes survive `kill` and only die on `force_kill`
    pub fn ignoring_sigterm() -> Self {
        Self::with_mode(FakeMode::IgnoreSigterm)
    }

    fn with_mode(mode: FakeMode) -> Self {
        Self {
            mode,
            processes: Mutex::new(Vec::new()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The `n`th launched process (0-based)
    pub fn process(&self, n: usize) -> Arc<FakeProcess> {
        self.processes.lock().unwrap()[n].clone()
    }

    pub fn config(&self, n: usize) -> PtyConfig {
        self.process(n).config.clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, config: PtyConfig) -> Result<LaunchedProcess, PtyError> {
        if self.mode == FakeMode::Failing {
            return Err(PtyError::CreateFailed(format!(
                "No such file or directory: {}",
                config.command
            )));
        }

        let mut processes = self.processes.lock().unwrap();
        let pid = processes.len() as u32 + 1;
        let (output_tx, output_rx) = broadcast::channel(64);
        let (exit_tx, exit_rx) = watch::channel(None);

        let process = Arc::new(FakeProcess {
            pid,
            config,
            ignore_sigterm: self.mode == FakeMode::IgnoreSigterm,
            output: Mutex::new(Some(output_tx)),
            exit: exit_tx,
            written: Mutex::new(Vec::new()),
            sizes: Mutex::new(Vec::new()),
            log: self.log.clone(),
        });
        processes.push(process.clone());
        self.log.lock().unwrap().push(format!("spawn p{pid}"));

        Ok(LaunchedProcess {
            process,
            output: output_rx,
            exit: exit_rx,
        })
    }
}

pub struct FakeProcess {
    pid: u32,
    config: PtyConfig,
    ignore_sigterm: bool,
    /// Dropped on exit, which ends the output stream like a PTY EOF
    output: Mutex<Option<broadcast::Sender<PtyOutput>>>,
    exit: watch::Sender<Option<i32>>,
    written: Mutex<Vec<String>>,
    sizes: Mutex<Vec<(u16, u16)>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeProcess {
    /// Produce output; ignored once the process has exited
    pub fn emit(&self, text: &str) {
        if let Some(tx) = self.output.lock().unwrap().as_ref() {
            let _ = tx.send(PtyOutput {
                data: text.as_bytes().to_vec(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            });
        }
    }

    /// Exit on its own with `code`
    pub fn exit(&self, code: i32) {
        self.output.lock().unwrap().take();
        self.exit.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(code);
                true
            } else {
                false
            }
        });
    }

    pub fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }

    /// Resizes received, as (cols, rows)
    pub fn sizes(&self) -> Vec<(u16, u16)> {
        self.sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionProcess for FakeProcess {
    async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        if self.exit.borrow().is_some() {
            return Err(PtyError::ProcessExited);
        }
        self.written
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(data).to_string());
        Ok(data.len())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.sizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    async fn kill(&self) -> Result<(), PtyError> {
        self.log.lock().unwrap().push(format!("kill p{}", self.pid));
        if !self.ignore_sigterm {
            self.exit(143);
        }
        Ok(())
    }

    async fn force_kill(&self) -> Result<(), PtyError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("force_kill p{}", self.pid));
        self.exit(137);
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}
