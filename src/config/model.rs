use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::backup::PipelineSettings;
use crate::types::{FailedGenerationPolicy, FailurePolicy};

/// On-disk YAML configuration; every key is optional.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, rename = "backupDir")]
    pub backup_dir: Option<String>,
    #[serde(default)]
    pub generations: Option<usize>,
    #[serde(default)]
    pub checkpoint: Option<String>,
    #[serde(default, rename = "timeLimit")]
    pub time_limit: Option<u64>,
    #[serde(default, rename = "memoryMargin")]
    pub memory_margin: Option<u32>,
    #[serde(default, rename = "pollInterval")]
    pub poll_interval: Option<u64>,
    #[serde(default, rename = "maxPollFailures")]
    pub max_poll_failures: Option<u32>,
    #[serde(default, rename = "onFailure")]
    pub on_failure: Option<String>,
    #[serde(default, rename = "failedGeneration")]
    pub failed_generation: Option<String>,
    #[serde(default)]
    pub connect: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub backup_dir: PathBuf,
    pub generations: usize,
    pub checkpoint: PathBuf,
    pub time_limit: Duration,
    pub memory_margin_percent: u32,
    pub poll_interval: Duration,
    pub max_poll_failures: u32,
    pub on_failure: FailurePolicy,
    pub failed_generation: FailedGenerationPolicy,
    pub connect: Option<String>,
    pub targets: Vec<String>,
}

impl RuntimeConfig {
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            backup_dir: self.backup_dir.clone(),
            generations: self.generations,
            memory_margin_percent: self.memory_margin_percent,
            poll_interval: self.poll_interval,
            max_poll_failures: self.max_poll_failures,
            failed_generation: self.failed_generation,
        }
    }
}
