//! kzorpd — policy engine daemon.
//!
//! Hosts one [`kzorp::Engine`] and serves the control protocol on a Unix
//! domain socket. Configuration is not persisted; the control peer pushes
//! it again after a restart.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kzorp::engine::Engine;
use kzorp_control::ControlServer;

#[derive(Parser)]
#[command(name = "kzorpd", version)]
struct Cli {
    /// Control socket path
    #[arg(long, default_value = "/run/kzorpd.sock")]
    socket: PathBuf,

    /// Verdict cache bucket count (rounded up to a power of two)
    #[arg(long, default_value_t = kzorp::DEFAULT_CACHE_BUCKETS)]
    cache_buckets: usize,

    /// Log filter, e.g. "info" or "kzorp=debug" (overrides RUST_LOG)
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match &cli.log_filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let engine = Arc::new(Engine::new(cli.cache_buckets));
    let server = ControlServer::new(engine, &cli.socket);
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    match server.run(shutdown).await {
        Ok(()) => {
            info!("kzorpd stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("control server failed: {err}");
            ExitCode::FAILURE
        }
    }
}
