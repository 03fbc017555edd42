//! Runtime settings resolved from environment, config, and defaults
//!
//! Resolution precedence for every knob: environment variable > config
//! field > built-in default. Only `BODY_PARSER_LIMIT` has a config-document
//! counterpart; the rest are process-level concerns.

use std::path::PathBuf;

use super::{parse_size, Config};

/// Default listener port.
pub const DEFAULT_PORT: u16 = 8088;

/// Default supervisor pool size.
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Hard cap on the supervisor pool size.
pub const MAX_WORKER_COUNT: usize = 32;

/// Default maximum JSON body size when neither env nor config set one.
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Process role, selected by `BUNGEE_ROLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Supervisor: spawns and manages the worker pool.
    Master,
    /// Worker: binds the shared port and serves requests.
    Worker,
}

impl Role {
    pub fn from_env() -> Self {
        match std::env::var("BUNGEE_ROLE").as_deref() {
            Ok("worker") => Role::Worker,
            _ => Role::Master,
        }
    }
}

/// Resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Listener port shared by all workers.
    pub port: u16,

    /// Supervisor pool size.
    pub worker_count: usize,

    /// Maximum accepted request body size in bytes.
    pub body_limit: usize,

    /// Resolved config document path.
    pub config_path: PathBuf,
}

impl Settings {
    /// Resolve settings against a loaded config document.
    ///
    /// `cli_port` and `cli_workers` come from command-line flags and rank
    /// above environment variables.
    pub fn resolve(
        config: &Config,
        config_path: PathBuf,
        cli_port: Option<u16>,
        cli_workers: Option<usize>,
    ) -> Self {
        let port = cli_port
            .or_else(|| env_parse::<u16>("PORT"))
            .unwrap_or(DEFAULT_PORT);

        let worker_count = cli_workers
            .or_else(|| env_parse::<usize>("WORKER_COUNT"))
            .unwrap_or(DEFAULT_WORKER_COUNT)
            .clamp(1, MAX_WORKER_COUNT);

        let body_limit = std::env::var("BODY_PARSER_LIMIT")
            .ok()
            .as_deref()
            .and_then(parse_size)
            .or_else(|| config.body_parser_limit.as_deref().and_then(parse_size))
            .unwrap_or(DEFAULT_BODY_LIMIT);

        Self {
            port,
            worker_count,
            body_limit,
            config_path,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
