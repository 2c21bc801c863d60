//! PTY Manager - single-process PTY adapter
//!
//! Spawns one OS process attached to a pseudo-terminal and exposes it as an
//! actor handle plus two event streams: output chunks and the exit code.
//! It has no knowledge of sessions, credentials or failure detection.
//!
//! # Example
//!
//! ```no_run
//! use pty_manager::{PtyActor, PtyConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PtyConfig {
//!         command: "/bin/bash".to_string(),
//!         working_dir: Some("/tmp".to_string()),
//!         ..Default::default()
//!     };
//!
//!     let mut spawned = PtyActor::spawn(config).unwrap();
//!     spawned.handle.write_str("echo hello\n").await.unwrap();
//!
//!     while let Ok(chunk) = spawned.output.recv().await {
//!         println!("{:?}", String::from_utf8_lossy(&chunk.data));
//!     }
//!     println!("exited: {:?}", spawned.handle.exit_code());
//! }
//! ```

mod error;
pub mod pty;

pub use error::PtyError;
pub use pty::{PtyActor, PtyConfig, PtyHandle, PtyOutput, PtySpawn, PtyState};
