use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::args::{Cli, Command};
use crate::cli::commands::{backup, status};
use crate::config::load::{load_config, CONFIG_FILE};
use crate::config::model::RuntimeConfig;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod args;
pub mod commands;

pub fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    info!(version = VERSION, "vm-backup");

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let mut cfg = load_config(&config_path, cli.config.is_some())?;
    apply_overrides(&mut cfg, &cli);

    let command = cli
        .command
        .clone()
        .unwrap_or_else(|| Command::Backup(cli.backup.clone()));
    let code = match command {
        Command::Backup(args) => backup::run_backup_command(&cfg, &args)?,
        Command::Status(args) => status::run_status_command(&cfg, &args)?,
    };
    Ok(code)
}

fn apply_overrides(cfg: &mut RuntimeConfig, cli: &Cli) {
    if let Some(checkpoint) = &cli.checkpoint {
        cfg.checkpoint = checkpoint.clone();
    }
    if let Some(dir) = &cli.backup_dir {
        cfg.backup_dir = dir.clone();
    }
    if let Some(generations) = cli.generations {
        cfg.generations = generations;
    }
    if let Some(uri) = &cli.connect {
        cfg.connect = Some(uri.clone());
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
