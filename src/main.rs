// bungee - programmable reverse HTTP proxy
//
// A supervisor process manages a pool of worker processes sharing one
// listening port. Workers run the request pipeline: route matching,
// weighted upstream selection with failover, layered request/response
// mutation rules with embedded expressions, API-format transformers, and
// SSE stream rewriting. Editing the config file triggers a validated
// rolling reload with rollback.
//
// Roles:
// - master (default): supervisor; spawns and recycles workers
// - worker (BUNGEE_ROLE=worker): binds the shared port and serves requests

mod balance;
mod cli;
mod config;
mod expr;
mod health;
mod net;
mod proxy;
mod rules;
mod supervisor;
mod transformers;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::Cli;
use config::{load_config, resolve_config_path, Role, Settings};
use supervisor::worker::{WorkerCommand, WorkerReport};
use supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing();

    let config_path = resolve_config_path(args.config.as_deref());

    if let Some(code) = cli::handle_command(&args, &config_path) {
        std::process::exit(code);
    }

    match Role::from_env() {
        Role::Master => run_master(config_path, &args).await,
        Role::Worker => run_worker(config_path, &args).await,
    }
}

/// Logs go to stderr in both roles; worker stdout belongs to the
/// supervisor protocol.
fn init_tracing() {
    let level = match std::env::var("LOG_LEVEL").as_deref() {
        Ok("fatal") => "error".to_string(),
        Ok(level) if !level.is_empty() => level.to_string(),
        _ => "info".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ─────────────────────────────────────────────────────────────────────────────
// Master role
// ─────────────────────────────────────────────────────────────────────────────

async fn run_master(config_path: PathBuf, args: &Cli) -> Result<()> {
    let config = load_config(&config_path)
        .with_context(|| format!("cannot start: {}", config_path.display()))?;
    let settings = Settings::resolve(&config, config_path, args.port, args.workers);

    tracing::info!(
        version = config::VERSION,
        port = settings.port,
        workers = settings.worker_count,
        config = %settings.config_path.display(),
        "starting supervisor"
    );

    Supervisor::new(config, &settings).run().await
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker role
// ─────────────────────────────────────────────────────────────────────────────

async fn run_worker(config_path: PathBuf, args: &Cli) -> Result<()> {
    let worker_id = std::env::var("BUNGEE_WORKER_ID").unwrap_or_else(|_| "0".to_string());

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            report(WorkerReport::Error {
                error: e.to_string(),
            });
            anyhow::bail!("worker {} failed to load config: {}", worker_id, e);
        }
    };
    let settings = Settings::resolve(&config, config_path, args.port, None);

    let addr: SocketAddr = ([0, 0, 0, 0], settings.port).into();
    let listener = match net::bind_shared(addr) {
        Ok(listener) => listener,
        Err(e) => {
            report(WorkerReport::Error {
                error: e.to_string(),
            });
            anyhow::bail!("worker {} failed to bind {}: {}", worker_id, addr, e);
        }
    };

    // The listener is live; tell the supervisor before serving.
    report(WorkerReport::Ready {
        pid: std::process::id(),
    });
    tracing::info!(worker = %worker_id, port = settings.port, "worker starting");

    proxy::start_worker(config, settings.body_limit, listener, shutdown_signal()).await
}

fn report(message: WorkerReport) {
    match serde_json::to_string(&message) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::error!(error = %e, "failed to serialize worker report"),
    }
}

/// Resolves when the supervisor sends a shutdown command, stdin closes
/// (orphaned worker), or the process receives SIGINT/SIGTERM.
async fn shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if serde_json::from_str::<WorkerCommand>(&line).is_ok() {
                            tracing::info!("shutdown command received");
                            return;
                        }
                        tracing::debug!(line = %line, "ignoring unknown command");
                    }
                    // stdin closed: the supervisor is gone.
                    _ => {
                        tracing::info!("supervisor channel closed, shutting down");
                        return;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT");
                return;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
                return;
            }
        }
    }
}
