// CLI module - command-line argument parsing and handlers
//
// Subcommands:
// - validate: parse and validate the config document, report, exit
// - config --path: print the resolved config path
// - config --show: print the validated config document

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::config::{load_config, VERSION};

/// Programmable reverse HTTP proxy
#[derive(Parser)]
#[command(name = "bungee")]
#[command(version = VERSION)]
#[command(about = "Programmable reverse HTTP proxy", long_about = None)]
pub struct Cli {
    /// Path to the config document (overrides CONFIG_PATH)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Listener port (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Worker pool size (overrides WORKER_COUNT)
    #[arg(long)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the config document and exit
    Validate,

    /// Inspect configuration
    Config {
        /// Print the resolved config path
        #[arg(long)]
        path: bool,

        /// Print the validated config document
        #[arg(long)]
        show: bool,
    },
}

/// Handle CLI subcommands. Returns an exit code if one was handled.
pub fn handle_command(cli: &Cli, config_path: &Path) -> Option<i32> {
    match &cli.command {
        Some(Commands::Validate) => Some(handle_validate(config_path)),
        Some(Commands::Config { path, show }) => {
            if *path {
                println!("{}", config_path.display());
            }
            if *show {
                match load_config(config_path) {
                    Ok(_) => match std::fs::read_to_string(config_path) {
                        Ok(raw) => println!("{}", raw.trim_end()),
                        Err(e) => {
                            eprintln!("cannot read {}: {}", config_path.display(), e);
                            return Some(1);
                        }
                    },
                    Err(e) => {
                        eprintln!("{}", e);
                        return Some(1);
                    }
                }
            }
            Some(0)
        }
        None => None,
    }
}

fn handle_validate(config_path: &Path) -> i32 {
    match load_config(config_path) {
        Ok(config) => {
            println!(
                "{} is valid ({} route{})",
                config_path.display(),
                config.routes.len(),
                if config.routes.len() == 1 { "" } else { "s" }
            );
            0
        }
        Err(e) => {
            eprintln!("{}", e);
            1
        }
    }
}
