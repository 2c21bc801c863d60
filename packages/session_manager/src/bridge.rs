//! JSON-lines command bridge
//!
//! Reads one command per line and writes replies and [`SessionEvent`]s as
//! JSON lines to an output channel.
//!
//! `create` and `kill` can wait on teardown grace periods and file writes, so
//! they run as tasks of their own. `input`, `resize`, `list` and `replay` are
//! handled inline, which keeps keystrokes for one session in order and never
//! queues them behind another session's lifecycle. A client should wait for
//! the `created` reply before sending input to a new session.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::events::SessionEvent;
use crate::registry::{LaunchSpec, SessionInfo, SessionRegistry};

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Create {
        id: String,
        #[serde(default)]
        shell: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    Input {
        id: String,
        data: String,
    },
    Resize {
        id: String,
        cols: u16,
        rows: u16,
    },
    Kill {
        id: String,
    },
    List,
    Replay {
        id: String,
        #[serde(default = "default_replay_bytes")]
        max_bytes: usize,
    },
}

impl Command {
    /// Commands that may wait on teardown or disk and so run off the read loop
    fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Create { .. } | Self::Kill { .. })
    }
}

fn default_replay_bytes() -> usize {
    64 * 1024
}

#[derive(Debug, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Created {
        id: String,
        instance_id: u64,
        resumed: bool,
    },
    Input {
        id: String,
        accepted: bool,
    },
    Resized {
        id: String,
    },
    Killed {
        id: String,
        existed: bool,
        credential_dir: Option<PathBuf>,
    },
    Sessions {
        sessions: Vec<SessionInfo>,
    },
    Replay {
        id: String,
        text: Option<String>,
    },
    Error {
        id: Option<String>,
        code: String,
        message: String,
    },
}

/// Serve commands from `input` until it ends or `shutdown` resolves, then
/// tear every session down. Close events from that teardown are written
/// before this returns.
pub async fn run<R, S>(
    registry: Arc<SessionRegistry>,
    input: R,
    out: mpsc::UnboundedSender<String>,
    shutdown: S,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    let (stop_tx, stop_rx) = oneshot::channel();
    let forwarder = tokio::spawn(forward_events(registry.subscribe(), out.clone(), stop_rx));
    let mut lifecycle = JoinSet::new();
    let mut lines = input.lines();
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line.context("Failed to read commands") {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("Command stream closed");
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                };
                if line.trim().is_empty() {
                    continue;
                }

                let command = match parse(&line) {
                    Ok(command) => command,
                    Err(reply) => {
                        send_json(&out, &reply);
                        continue;
                    }
                };
                if command.is_lifecycle() {
                    let registry = registry.clone();
                    let out = out.clone();
                    lifecycle.spawn(async move {
                        let reply = execute(&registry, command).await;
                        send_json(&out, &reply);
                    });
                } else {
                    let reply = execute(&registry, command).await;
                    send_json(&out, &reply);
                }
                while lifecycle.try_join_next().is_some() {}
            }
            _ = &mut shutdown => {
                info!("Interrupted");
                break Ok(());
            }
        }
    };

    // Let in-flight creates finish so none registers after shutdown
    while lifecycle.join_next().await.is_some() {}
    registry.shutdown_all().await;

    let _ = stop_tx.send(());
    if let Err(e) = forwarder.await {
        warn!("Event forwarder failed: {}", e);
    }
    result
}

fn parse(line: &str) -> Result<Command, Reply> {
    serde_json::from_str(line).map_err(|e| {
        warn!("Unparseable command: {}", e);
        Reply::Error {
            id: None,
            code: "bad_request".to_string(),
            message: e.to_string(),
        }
    })
}

async fn execute(registry: &SessionRegistry, command: Command) -> Reply {
    debug!("Command: {:?}", command);

    match command {
        Command::Create {
            id,
            shell,
            args,
            cwd,
            env,
            cols,
            rows,
        } => {
            let defaults = LaunchSpec::default();
            let spec = LaunchSpec {
                shell,
                args,
                cwd,
                env,
                cols: cols.unwrap_or(defaults.cols),
                rows: rows.unwrap_or(defaults.rows),
            };
            match registry.create(&id, spec).await {
                Ok(outcome) => Reply::Created {
                    id,
                    instance_id: outcome.instance_id.0,
                    resumed: outcome.resumed,
                },
                Err(e) => Reply::Error {
                    id: Some(id),
                    code: e.error_code().to_string(),
                    message: e.to_string(),
                },
            }
        }
        Command::Input { id, data } => {
            let accepted = registry.input(&id, &data).await;
            Reply::Input { id, accepted }
        }
        Command::Resize { id, cols, rows } => {
            registry.resize(&id, cols, rows).await;
            Reply::Resized { id }
        }
        Command::Kill { id } => {
            let closed = registry.kill(&id).await;
            Reply::Killed {
                id,
                existed: closed.is_some(),
                credential_dir: closed.and_then(|c| c.credential_dir),
            }
        }
        Command::List => Reply::Sessions {
            sessions: registry.list().await,
        },
        Command::Replay { id, max_bytes } => {
            let text = registry.recent_output(&id, max_bytes).await;
            Reply::Replay { id, text }
        }
    }
}

/// Forward events until told to stop, then flush whatever was broadcast
/// before the stop signal.
async fn forward_events(
    mut events: broadcast::Receiver<SessionEvent>,
    out: mpsc::UnboundedSender<String>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => send_json(&out, &event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event stream lagged, {} event(s) dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = &mut stop => break,
        }
    }

    loop {
        match events.try_recv() {
            Ok(event) => send_json(&out, &event),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                warn!("Event stream lagged, {} event(s) dropped", n);
            }
            Err(_) => break,
        }
    }
}

fn send_json<T: Serialize>(out: &mpsc::UnboundedSender<String>, value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => {
            let _ = out.send(line);
        }
        Err(e) => warn!("Failed to serialize message: {}", e),
    }
}
