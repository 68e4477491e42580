//! Append-only record of targets backed up in the current cycle.
//!
//! One identifier per line. Every append is synced before it returns, which
//! is the crash-safety boundary: a crash loses at most the target in flight.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{BackupError, Result};
use crate::types::TargetId;

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Recorded targets; empty when there is no checkpoint yet. Lines that
    /// are not target identifiers are skipped.
    pub fn load(&self) -> Result<BTreeSet<TargetId>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => return Err(BackupError::checkpoint(&self.path, err)),
        };
        let mut recorded = BTreeSet::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<TargetId>() {
                Ok(id) => {
                    recorded.insert(id);
                }
                Err(err) => warn!(
                    checkpoint = %self.path.display(),
                    line = lineno + 1,
                    error = %err,
                    "skipping malformed checkpoint line"
                ),
            }
        }
        Ok(recorded)
    }

    pub fn append(&self, id: &TargetId) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| BackupError::checkpoint(&self.path, e))?;
        writeln!(file, "{}", id).map_err(|e| BackupError::checkpoint(&self.path, e))?;
        file.sync_all()
            .map_err(|e| BackupError::checkpoint(&self.path, e))
    }

    pub fn reset(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BackupError::checkpoint(&self.path, err)),
        }
    }
}
