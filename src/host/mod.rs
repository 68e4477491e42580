//! Operations the backup pipeline needs from the virtualization host.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[cfg(test)]
pub(crate) mod fake;
pub mod virsh;

pub use virsh::VirshHost;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Other(String),
}

impl DiskFormat {
    pub fn from_source(source: &Path) -> Self {
        match source.extension().and_then(|ext| ext.to_str()) {
            Some(ext) => match ext.to_ascii_lowercase().as_str() {
                "qcow2" => DiskFormat::Qcow2,
                "raw" | "img" => DiskFormat::Raw,
                other => DiskFormat::Other(other.to_string()),
            },
            None => DiskFormat::Other(String::new()),
        }
    }

    /// Only qcow2 images can be mirrored while the guest keeps running.
    pub fn supports_live_snapshot(&self) -> bool {
        matches!(self, DiskFormat::Qcow2)
    }

    pub fn as_str(&self) -> &str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Other(name) => name,
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One storage device attached to a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// Guest-side device name, e.g. `vda`.
    pub target: String,
    /// Image backing the device on the host.
    pub source: PathBuf,
    pub format: DiskFormat,
}

impl BlockDevice {
    pub fn new(target: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        let source = source.into();
        let format = DiskFormat::from_source(&source);
        Self {
            target: target.into(),
            source,
            format,
        }
    }

    /// File name of this device's copy inside a generation directory.
    pub fn backup_file_name(&self) -> String {
        if self.format.as_str().is_empty() {
            self.target.clone()
        } else {
            format!("{}.{}", self.target, self.format)
        }
    }
}

/// A single sample of a device copy job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobProgress {
    Percent(u8),
    /// The host reports no job for the device; it finished abnormally or was
    /// aborted behind our back.
    NoJob,
    /// The sample could not be interpreted; worth another look.
    Unreadable(String),
}

pub trait VirtHost {
    fn list_domains(&self) -> Result<Vec<String>>;
    fn block_devices(&self, domain: &str) -> Result<Vec<BlockDevice>>;
    /// Bytes allocated on the host for the device image.
    fn device_allocation(&self, domain: &str, device: &BlockDevice) -> Result<u64>;
    /// Bytes of guest memory a state capture will write.
    fn memory_size(&self, domain: &str) -> Result<u64>;
    fn dump_definition(&self, domain: &str, dest: &Path) -> Result<()>;
    fn undefine(&self, domain: &str) -> Result<()>;
    fn define(&self, definition: &Path) -> Result<()>;
    fn suspend(&self, domain: &str) -> Result<()>;
    fn resume(&self, domain: &str) -> Result<()>;
    fn start_block_copy(&self, domain: &str, device: &BlockDevice, dest: &Path) -> Result<()>;
    fn block_job_progress(&self, domain: &str, device: &BlockDevice) -> Result<JobProgress>;
    /// Ends a copy job that reached 100%, keeping the copy.
    fn finish_block_copy(&self, domain: &str, device: &BlockDevice) -> Result<()>;
    /// Cancels a copy job that is still running.
    fn abort_block_copy(&self, domain: &str, device: &BlockDevice) -> Result<()>;
    /// Writes the domain's memory state to `dest`; the domain stops.
    fn save_memory(&self, domain: &str, dest: &Path) -> Result<()>;
    /// Brings a domain back to running from a state file.
    fn restore_memory(&self, state: &Path) -> Result<()>;
}
