//! The seam between the session registry and real PTY processes.
//!
//! The registry only ever talks to [`ProcessLauncher`] and [`SessionProcess`],
//! so tests can substitute scripted processes for real ones.

use async_trait::async_trait;
use pty_manager::{PtyActor, PtyConfig, PtyError, PtyHandle, PtyOutput};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Commands accepted by a running session process
#[async_trait]
pub trait SessionProcess: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<usize, PtyError>;

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;

    /// Terminate the process. Succeeds if it has already exited.
    async fn kill(&self) -> Result<(), PtyError>;

    /// Terminate without giving the process a chance to clean up
    async fn force_kill(&self) -> Result<(), PtyError> {
        self.kill().await
    }

    fn pid(&self) -> Option<u32>;
}

/// A freshly spawned process and its two event streams
pub struct LaunchedProcess {
    pub process: Arc<dyn SessionProcess>,
    pub output: broadcast::Receiver<PtyOutput>,
    pub exit: watch::Receiver<Option<i32>>,
}

/// Spawns session processes. Spawn failures surface synchronously.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, config: PtyConfig) -> Result<LaunchedProcess, PtyError>;
}

/// Launches real PTY-backed processes via `pty_manager`
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLauncher;

impl ProcessLauncher for NativeLauncher {
    fn launch(&self, config: PtyConfig) -> Result<LaunchedProcess, PtyError> {
        let spawned = PtyActor::spawn(config)?;
        Ok(LaunchedProcess {
            process: Arc::new(spawned.handle),
            output: spawned.output,
            exit: spawned.exit,
        })
    }
}

#[async_trait]
impl SessionProcess for PtyHandle {
    async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        PtyHandle::write(self, data).await
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        PtyHandle::resize(self, rows, cols).await
    }

    async fn kill(&self) -> Result<(), PtyError> {
        PtyHandle::kill(self, None).await
    }

    async fn force_kill(&self) -> Result<(), PtyError> {
        PtyHandle::kill(self, Some("SIGKILL")).await
    }

    fn pid(&self) -> Option<u32> {
        PtyHandle::pid(self)
    }
}

/// Shell used when a launch spec names none
pub fn default_shell() -> String {
    #[cfg(windows)]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }
    #[cfg(not(windows))]
    {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/bash".to_string())
    }
}
