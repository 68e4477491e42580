use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::types::FailurePolicy;

#[derive(Parser, Debug)]
#[command(
    name = "vm-backup",
    version,
    about = "Backs up virtual machines within a time limit and picks up where it left off on the next run",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub backup: BackupArgs,

    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Checkpoint file recording targets backed up this cycle
    #[arg(long, visible_alias = "cf", global = true)]
    pub checkpoint: Option<PathBuf>,
    /// Directory holding the backup generations
    #[arg(long, global = true)]
    pub backup_dir: Option<PathBuf>,
    /// Generations kept per target (at least 1)
    #[arg(long, global = true, value_parser = parse_generations)]
    pub generations: Option<usize>,
    /// libvirt connection URI
    #[arg(long, global = true)]
    pub connect: Option<String>,
    /// Verbose logging
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

fn parse_generations(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Back up pending targets (default)
    Backup(BackupArgs),
    /// Show cycle progress without backing anything up
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct BackupArgs {
    /// Domain name patterns, or file globs when they contain '/'
    pub targets: Vec<String>,
    /// Stop starting new targets after this many seconds
    #[arg(long, short = 't', value_name = "SECS")]
    pub time_limit: Option<u64>,
    /// Discard the checkpoint and start a new cycle
    #[arg(long, short = 's')]
    pub start_over: bool,
    /// What to do when a target fails: abort or skip
    #[arg(long, value_parser = FailurePolicy::parse)]
    pub on_failure: Option<FailurePolicy>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct StatusArgs {
    /// Domain name patterns, or file globs when they contain '/'
    pub targets: Vec<String>,
}
