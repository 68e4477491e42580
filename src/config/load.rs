use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::model::{Config, RuntimeConfig};
use crate::error::{BackupError, ConfigError, Result};
use crate::types::{FailedGenerationPolicy, FailurePolicy};

pub const CONFIG_FILE: &str = "/etc/vm-backup.yaml";
const DEFAULT_BACKUP_DIR: &str = "/var/backups/vm-backup";
const DEFAULT_CHECKPOINT: &str = "backup.chkpnt";
const DEFAULT_GENERATIONS: usize = 2;
const DEFAULT_TIME_LIMIT_S: u64 = 3600;
const DEFAULT_MEMORY_MARGIN: u32 = 120;
const DEFAULT_POLL_INTERVAL_S: u64 = 5;
const DEFAULT_MAX_POLL_FAILURES: u32 = 12;

/// Loads `path`. A missing file yields the defaults unless it was asked for
/// explicitly.
pub fn load_config(path: &Path, explicit: bool) -> Result<RuntimeConfig> {
    let mut contents = String::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_string(&mut contents)
                .map_err(|e| BackupError::message(format!("read {}: {}", path.display(), e)))?;
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound && !explicit => {
            return parse_runtime(Config::default());
        }
        Err(err) => {
            return Err(BackupError::message(format!("read {}: {}", path.display(), err)));
        }
    }
    if contents.trim().is_empty() {
        return parse_runtime(Config::default());
    }
    let cfg: Config =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
    parse_runtime(cfg)
}

pub fn parse_runtime(cfg: Config) -> Result<RuntimeConfig> {
    let generations = cfg.generations.unwrap_or(DEFAULT_GENERATIONS);
    if generations == 0 {
        return Err(ConfigError::Invalid("generations must be at least 1".to_string()).into());
    }
    let memory_margin_percent = cfg.memory_margin.unwrap_or(DEFAULT_MEMORY_MARGIN);
    if memory_margin_percent < 100 {
        return Err(ConfigError::Invalid(format!(
            "memoryMargin {} is below 100 percent",
            memory_margin_percent
        ))
        .into());
    }
    let max_poll_failures = cfg.max_poll_failures.unwrap_or(DEFAULT_MAX_POLL_FAILURES);
    if max_poll_failures == 0 {
        return Err(ConfigError::Invalid("maxPollFailures must be at least 1".to_string()).into());
    }
    let on_failure = match cfg.on_failure.as_deref() {
        Some(value) => FailurePolicy::parse(value).map_err(ConfigError::Invalid)?,
        None => FailurePolicy::Abort,
    };
    let failed_generation = match cfg.failed_generation.as_deref() {
        Some(value) => FailedGenerationPolicy::parse(value).map_err(ConfigError::Invalid)?,
        None => FailedGenerationPolicy::Delete,
    };
    let backup_dir = cfg
        .backup_dir
        .unwrap_or_else(|| DEFAULT_BACKUP_DIR.to_string());
    if backup_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("backupDir is empty".to_string()).into());
    }

    Ok(RuntimeConfig {
        backup_dir: PathBuf::from(backup_dir),
        generations,
        checkpoint: PathBuf::from(
            cfg.checkpoint
                .unwrap_or_else(|| DEFAULT_CHECKPOINT.to_string()),
        ),
        time_limit: Duration::from_secs(cfg.time_limit.unwrap_or(DEFAULT_TIME_LIMIT_S)),
        memory_margin_percent,
        poll_interval: Duration::from_secs(cfg.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL_S)),
        max_poll_failures,
        on_failure,
        failed_generation,
        connect: cfg.connect.filter(|uri| !uri.trim().is_empty()),
        targets: cfg.targets,
    })
}
