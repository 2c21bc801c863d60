/// Errors that can occur during PTY operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum PtyError {
    /// Failed to open the PTY or spawn the process
    #[error("failed to create PTY: {0}")]
    CreateFailed(String),
    /// Failed to write to PTY
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),
    /// Failed to resize PTY
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),
    /// Failed to kill PTY process
    #[error("failed to kill PTY: {0}")]
    KillFailed(String),
    /// PTY process has exited
    #[error("PTY process has exited")]
    ProcessExited,
    /// Channel communication error
    #[error("channel error: {0}")]
    ChannelError(String),
}
