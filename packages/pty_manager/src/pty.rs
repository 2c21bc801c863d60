#[cfg(not(unix))]
use portable_pty::ChildKiller;
use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::error::PtyError;

/// Capacity of the per-process output channel. Slow consumers lag and skip
/// chunks rather than stalling the reader thread.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Configuration for spawning a PTY
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: "/bin/bash".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }
}

/// State of a PTY session
#[derive(Clone, Debug)]
pub struct PtyState {
    pub running: bool,
    pub pid: Option<u32>,
    pub command: String,
    pub args: Vec<String>,
    pub rows: u16,
    pub cols: u16,
    pub exit_code: Option<i32>,
}

/// Output chunk from a PTY
#[derive(Clone, Debug)]
pub struct PtyOutput {
    pub data: Vec<u8>,
    pub timestamp: i64,
}

/// Messages that can be sent to the PTY actor
pub(crate) enum PtyMessage {
    WriteInput {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<usize, PtyError>>,
    },
    Resize {
        rows: u16,
        cols: u16,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    GetState {
        respond_to: oneshot::Sender<PtyState>,
    },
    Kill {
        signal: Option<String>,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
}

/// Everything produced by a successful spawn: the command handle and the
/// two event streams. The output receiver is subscribed before the reader
/// thread starts, so it sees every chunk the process writes.
pub struct PtySpawn {
    pub handle: PtyHandle,
    pub output: broadcast::Receiver<PtyOutput>,
    pub exit: watch::Receiver<Option<i32>>,
}

/// Handle to communicate with a PTY actor
#[derive(Clone)]
pub struct PtyHandle {
    sender: mpsc::Sender<PtyMessage>,
    exit: watch::Receiver<Option<i32>>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Write data to the PTY
    pub async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::WriteInput {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelError("Failed to send write message".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelError("Failed to receive write response".into()))?
    }

    /// Write a string to the PTY
    pub async fn write_str(&self, text: &str) -> Result<usize, PtyError> {
        self.write(text.as_bytes()).await
    }

    /// Resize the PTY. A no-op once the process has exited.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        if self.has_exited() {
            debug!("Ignoring resize of exited PTY (pid {:?})", self.pid);
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(PtyMessage::Resize {
                rows,
                cols,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            debug!("PTY actor gone, resize dropped");
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Get the current state of the PTY
    pub async fn state(&self) -> Result<PtyState, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| PtyError::ChannelError("Failed to send state message".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelError("Failed to receive state response".into()))
    }

    /// Kill the PTY process. `None` sends SIGTERM on unix; `"SIGKILL"` forces.
    /// Killing a process that already exited succeeds silently.
    pub async fn kill(&self, signal: Option<&str>) -> Result<(), PtyError> {
        if self.has_exited() {
            debug!("Ignoring kill of exited PTY (pid {:?})", self.pid);
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(PtyMessage::Kill {
                signal: signal.map(|s| s.to_string()),
                respond_to: tx,
            })
            .await
            .is_err()
        {
            debug!("PTY actor gone, kill dropped");
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Process id of the child, if the platform reported one
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code, once the process has exited
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

/// The PTY actor that owns a single PTY-backed process
pub struct PtyActor {
    master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    #[cfg(not(unix))]
    killer: Box<dyn ChildKiller + Send + Sync>,
    state: PtyState,
    exit: watch::Receiver<Option<i32>>,
    receiver: mpsc::Receiver<PtyMessage>,
}

impl PtyActor {
    /// Spawn a new PTY process and return its handle and event streams.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: PtyConfig) -> Result<PtySpawn, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::CreateFailed(format!("Failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&config.command);
        for arg in &config.args {
            cmd.arg(arg);
        }

        if let Some(dir) = &config.working_dir {
            info!("Setting working directory: {}", dir);
            cmd.cwd(dir);
        }

        // Set environment for proper terminal behavior
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        // Inherit PATH and other essential environment variables
        for key in ["PATH", "HOME", "USER"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning PTY command: {} with args: {:?}",
            config.command, config.args
        );

        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn command '{}': {}", config.command, e);
            PtyError::CreateFailed(e.to_string())
        })?;
        // The child holds its own copy; keeping ours open would block EOF.
        drop(pair.slave);

        let pid = child.process_id();
        info!("PTY process started with PID: {:?}", pid);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::CreateFailed(format!("Failed to clone PTY reader: {}", e)))?;
        #[cfg(not(unix))]
        let killer = child.clone_killer();

        let (output_tx, output_rx) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (msg_tx, msg_rx) = mpsc::channel(32);

        std::thread::spawn(move || {
            let mut buffer = vec![0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        debug!("PTY EOF detected");
                        break;
                    }
                    Ok(n) => {
                        let output = PtyOutput {
                            data: buffer[..n].to_vec(),
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        };
                        let _ = output_tx.send(output);
                    }
                    Err(e) => {
                        // EIO is the normal end-of-stream on Linux once the child is gone
                        debug!("PTY read ended: {}", e);
                        break;
                    }
                }
            }
            debug!("PTY reader thread exiting");
        });

        std::thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(e) => {
                    warn!("Failed to wait for PTY child: {}", e);
                    -1
                }
            };
            info!("PTY process {:?} exited with code {}", pid, code);
            let _ = exit_tx.send(Some(code));
        });

        let actor = Self {
            master: pair.master,
            writer: None,
            #[cfg(not(unix))]
            killer,
            state: PtyState {
                running: true,
                pid,
                command: config.command.clone(),
                args: config.args.clone(),
                rows: config.rows,
                cols: config.cols,
                exit_code: None,
            },
            exit: exit_rx.clone(),
            receiver: msg_rx,
        };

        tokio::spawn(actor.run());

        Ok(PtySpawn {
            handle: PtyHandle {
                sender: msg_tx,
                exit: exit_rx.clone(),
                pid,
            },
            output: output_rx,
            exit: exit_rx,
        })
    }

    async fn run(mut self) {
        debug!(
            "PTY actor started for command: {} with PID: {:?}",
            self.state.command, self.state.pid
        );

        // Take the writer immediately to keep the PTY stdin open
        match self.master.take_writer() {
            Ok(writer) => self.writer = Some(writer),
            Err(e) => error!("Failed to get PTY writer: {}", e),
        }

        while let Some(msg) = self.receiver.recv().await {
            self.refresh_exit();
            match msg {
                PtyMessage::WriteInput { data, respond_to } => {
                    let _ = respond_to.send(self.handle_write_input(&data));
                }
                PtyMessage::Resize {
                    rows,
                    cols,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.handle_resize(rows, cols));
                }
                PtyMessage::GetState { respond_to } => {
                    let _ = respond_to.send(self.state.clone());
                }
                PtyMessage::Kill { signal, respond_to } => {
                    let _ = respond_to.send(self.handle_kill(signal));
                }
            }
        }

        debug!("PTY actor shutting down (pid {:?})", self.state.pid);
    }

    fn refresh_exit(&mut self) {
        if let Some(code) = *self.exit.borrow() {
            self.state.running = false;
            self.state.exit_code = Some(code);
        }
    }

    fn handle_write_input(&mut self, data: &[u8]) -> Result<usize, PtyError> {
        if !self.state.running {
            return Err(PtyError::ProcessExited);
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PtyError::WriteFailed("No PTY writer available".into()))?;

        writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;

        Ok(data.len())
    }

    fn handle_resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        if !self.state.running {
            return Ok(());
        }

        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;

        self.state.rows = rows;
        self.state.cols = cols;
        Ok(())
    }

    fn handle_kill(&mut self, signal: Option<String>) -> Result<(), PtyError> {
        if !self.state.running {
            return Ok(());
        }

        match signal.as_deref() {
            Some("SIGTERM") | None => {
                #[cfg(unix)]
                {
                    use nix::errno::Errno;
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;

                    if let Some(pid) = self.state.pid {
                        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                            Ok(()) | Err(Errno::ESRCH) => {}
                            Err(e) => return Err(PtyError::KillFailed(e.to_string())),
                        }
                    }
                }
                #[cfg(not(unix))]
                {
                    self.killer
                        .kill()
                        .map_err(|e| PtyError::KillFailed(e.to_string()))?;
                }
            }
            Some("SIGKILL") => {
                // The cloned ChildKiller only sends SIGHUP on unix
                #[cfg(unix)]
                {
                    use nix::errno::Errno;
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;

                    if let Some(pid) = self.state.pid {
                        match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                            Ok(()) | Err(Errno::ESRCH) => {}
                            Err(e) => return Err(PtyError::KillFailed(e.to_string())),
                        }
                    }
                }
                #[cfg(not(unix))]
                {
                    self.killer
                        .kill()
                        .map_err(|e| PtyError::KillFailed(e.to_string()))?;
                }
            }
            Some(sig) => {
                return Err(PtyError::KillFailed(format!("Unsupported signal: {}", sig)));
            }
        }

        Ok(())
    }
}
