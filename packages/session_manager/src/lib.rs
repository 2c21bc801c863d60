//! Session Manager - PTY session lifecycle and credential-failure detection
//!
//! Keyed PTY sessions for a terminal multiplexer front end:
//!
//! - [`SessionRegistry`]: create / resume / kill / shutdown with a concurrent
//!   session cap, instance ids that discard events from superseded processes,
//!   and an ordered teardown sequence
//! - [`OutputPipeline`]: UTF-8 reassembly, escape filtering and replay
//! - [`FailureDetector`]: recognizes credential and quota failures in output
//!   without being fooled by startup noise or replayed history
//! - [`CredentialMaterializer`]: writes per-session credential files through
//!   a serialized [`FileOpQueue`] before the process starts
//!
//! [`bridge::run`] serves the registry over JSON lines for `sessiond`.
//!
//! The registry talks to processes through [`ProcessLauncher`], backed in
//! production by `pty_manager`.

pub mod ansi;
pub mod bridge;
pub mod config;
pub mod credentials;
pub mod detector;
mod error;
pub mod events;
pub mod file_queue;
pub mod patterns;
pub mod pipeline;
pub mod process;
pub mod registry;

#[cfg(test)]
mod test_helpers;

pub use config::{FileConfig, SessionConfig, load_config};
pub use credentials::{CredentialMaterializer, CredentialSettings, MaterializeError};
pub use detector::{DetectionSettings, Failure, FailureDetector};
pub use error::SessionError;
pub use events::{InstanceId, SessionEvent};
pub use file_queue::{FileOpError, FileOpQueue};
pub use patterns::{PatternBank, PatternSpec};
pub use pipeline::OutputPipeline;
pub use process::{LaunchedProcess, NativeLauncher, ProcessLauncher, SessionProcess};
pub use registry::{
    ClosedSession, CreateOutcome, LaunchSpec, SessionInfo, SessionRegistry, SessionState,
};
