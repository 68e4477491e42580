use std::process::ExitCode;
use std::time::Duration;

use tracing::{error, info};

use crate::backup::{CheckpointStore, Pipeline, Scheduler};
use crate::cli::args::BackupArgs;
use crate::cli::commands::{exit_code_for, select_patterns, EXIT_LOCKED};
use crate::config::model::RuntimeConfig;
use crate::error::Result;
use crate::host::VirshHost;
use crate::targets::expand_targets;
use crate::util::lock::{acquire, lock_path_for};
use crate::util::paths::ensure_backup_dir;

pub fn run_backup_command(cfg: &RuntimeConfig, args: &BackupArgs) -> Result<ExitCode> {
    let lock_path = lock_path_for(&cfg.checkpoint);
    let _lock = match acquire(&lock_path)? {
        Some(lock) => lock,
        None => {
            error!(lock = %lock_path.display(), "another backup run is in progress");
            return Ok(ExitCode::from(EXIT_LOCKED));
        }
    };

    ensure_backup_dir(&cfg.backup_dir)?;
    let time_limit = args
        .time_limit
        .map(Duration::from_secs)
        .unwrap_or(cfg.time_limit);
    let policy = args.on_failure.unwrap_or(cfg.on_failure);
    info!(
        backup_dir = %cfg.backup_dir.display(),
        checkpoint = %cfg.checkpoint.display(),
        generations = cfg.generations,
        time_limit_s = time_limit.as_secs(),
        on_failure = policy.as_str(),
        failed_generation = cfg.failed_generation.as_str(),
        "starting backup run"
    );

    let host = VirshHost::new(cfg.connect.clone());
    let targets = expand_targets(select_patterns(&args.targets, &cfg.targets), &host)?;
    let pipeline = Pipeline::new(&host, cfg.pipeline_settings());
    let scheduler = Scheduler::new(&pipeline, CheckpointStore::new(&cfg.checkpoint), policy);
    let report = scheduler.run(&targets, time_limit, args.start_over)?;
    for (id, failure) in &report.failed {
        error!(vm = %id, %failure, "skipped after failure");
    }
    Ok(exit_code_for(&report))
}
