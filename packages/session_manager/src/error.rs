use pty_manager::PtyError;

use crate::credentials::MaterializeError;

/// Errors surfaced to callers of the command surface.
///
/// Background failures (teardown steps, resize, stale events) are logged and
/// never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session limit reached ({max} concurrent sessions)")]
    Capacity { max: usize },

    #[error("invalid session id {0:?}")]
    InvalidId(String),

    #[error("failed to start session process: {0}")]
    Spawn(#[source] PtyError),

    #[error(transparent)]
    Materialization(#[from] MaterializeError),
}

impl SessionError {
    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Capacity { .. } => "capacity",
            Self::InvalidId(_) => "invalid_id",
            Self::Spawn(_) => "spawn_failed",
            Self::Materialization(_) => "materialization_failed",
        }
    }
}
