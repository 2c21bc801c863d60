use anyhow::{Context, Result};
use clap::Parser;
use session_manager::{FileConfig, NativeLauncher, SessionConfig, SessionRegistry, bridge, load_config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

/// PTY session daemon speaking JSON lines on stdin/stdout
#[derive(Parser, Debug)]
#[command(name = "sessiond", version)]
struct Args {
    /// Directory holding config.toml
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override [sessions] max_sessions
    #[arg(long)]
    max_sessions: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries the protocol; logs go to stderr
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let file_config: FileConfig = load_config(&args.config_dir)
        .extract()
        .with_context(|| format!("Failed to load config from {:?}", args.config_dir))?;
    let mut config = SessionConfig::from_file(&file_config)?;
    if let Some(max) = args.max_sessions {
        config.max_sessions = max;
    }

    info!(
        "Starting sessiond (max {} sessions, cwd {})",
        config.max_sessions,
        config.default_cwd.display()
    );

    let registry = Arc::new(SessionRegistry::new(config, Arc::new(NativeLauncher)));

    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_lines(out_rx));

    let result = bridge::run(
        registry,
        BufReader::new(tokio::io::stdin()),
        out_tx,
        async {
            let _ = tokio::signal::ctrl_c().await;
        },
    )
    .await;

    // The bridge dropped its sender, so the writer ends once flushed
    let _ = writer.await;
    info!("sessiond stopped");
    result
}

async fn write_lines(mut lines: mpsc::UnboundedReceiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.recv().await {
        if stdout.write_all(line.as_bytes()).await.is_err()
            || stdout.write_all(b"\n").await.is_err()
            || stdout.flush().await.is_err()
        {
            warn!("stdout closed, dropping output");
            break;
        }
    }
}
