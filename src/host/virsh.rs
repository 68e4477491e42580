use std::fs;
use std::path::Path;
use std::process::Command;

use crate::error::{BackupError, HostError, Result};
use crate::host::{BlockDevice, JobProgress, VirtHost};
use crate::util::command::{command_output, run_checked};

/// libvirt host driven through the `virsh` command line client.
#[derive(Debug, Clone, Default)]
pub struct VirshHost {
    connect: Option<String>,
}

impl VirshHost {
    pub fn new(connect: Option<String>) -> Self {
        Self { connect }
    }

    fn virsh(&self) -> Command {
        let mut cmd = Command::new("virsh");
        if let Some(uri) = &self.connect {
            cmd.arg("-c").arg(uri);
        }
        cmd
    }
}

impl VirtHost for VirshHost {
    fn list_domains(&self) -> Result<Vec<String>> {
        let mut cmd = self.virsh();
        cmd.arg("list").arg("--all").arg("--name");
        Ok(parse_domain_list(&command_output(&mut cmd)?))
    }

    fn block_devices(&self, domain: &str) -> Result<Vec<BlockDevice>> {
        let mut cmd = self.virsh();
        cmd.arg("domblklist").arg("--details").arg(domain);
        Ok(parse_domblklist(&command_output(&mut cmd)?))
    }

    fn device_allocation(&self, domain: &str, device: &BlockDevice) -> Result<u64> {
        let mut cmd = self.virsh();
        cmd.arg("domblkinfo").arg(domain).arg(&device.target);
        let out = command_output(&mut cmd)?;
        parse_labeled_number(&out, "Allocation").ok_or_else(|| {
            HostError::Parse(format!("domblkinfo {} {}: no Allocation", domain, device.target)).into()
        })
    }

    fn memory_size(&self, domain: &str) -> Result<u64> {
        let mut cmd = self.virsh();
        cmd.arg("dominfo").arg(domain);
        let out = command_output(&mut cmd)?;
        let kib = parse_labeled_number(&out, "Used memory")
            .or_else(|| parse_labeled_number(&out, "Max memory"))
            .ok_or_else(|| HostError::Parse(format!("dominfo {}: no memory size", domain)))?;
        Ok(kib.saturating_mul(1024))
    }

    fn dump_definition(&self, domain: &str, dest: &Path) -> Result<()> {
        let mut cmd = self.virsh();
        cmd.arg("dumpxml").arg("--security-info").arg(domain);
        let xml = command_output(&mut cmd)?;
        fs::write(dest, xml).map_err(|e| {
            BackupError::message(format!("write {}: {}", dest.display(), e))
        })
    }

    fn undefine(&self, domain: &str) -> Result<()> {
        run_checked(self.virsh().arg("undefine").arg(domain))
    }

    fn define(&self, definition: &Path) -> Result<()> {
        run_checked(self.virsh().arg("define").arg(definition))
    }

    fn suspend(&self, domain: &str) -> Result<()> {
        run_checked(self.virsh().arg("suspend").arg(domain))
    }

    fn resume(&self, domain: &str) -> Result<()> {
        run_checked(self.virsh().arg("resume").arg(domain))
    }

    fn start_block_copy(&self, domain: &str, device: &BlockDevice, dest: &Path) -> Result<()> {
        let mut cmd = self.virsh();
        cmd.arg("blockcopy").arg(domain).arg(&device.target).arg(dest);
        if !device.format.as_str().is_empty() {
            cmd.arg("--format").arg(device.format.as_str());
        }
        run_checked(&mut cmd)
    }

    fn block_job_progress(&self, domain: &str, device: &BlockDevice) -> Result<JobProgress> {
        let mut cmd = self.virsh();
        cmd.arg("blockjob").arg(domain).arg(&device.target).arg("--info");
        Ok(parse_blockjob(&command_output(&mut cmd)?))
    }

    fn finish_block_copy(&self, domain: &str, device: &BlockDevice) -> Result<()> {
        run_checked(
            self.virsh()
                .arg("blockjob")
                .arg(domain)
                .arg(&device.target)
                .arg("--abort"),
        )
    }

    fn abort_block_copy(&self, domain: &str, device: &BlockDevice) -> Result<()> {
        self.finish_block_copy(domain, device)
    }

    fn save_memory(&self, domain: &str, dest: &Path) -> Result<()> {
        run_checked(self.virsh().arg("save").arg(domain).arg(dest))
    }

    fn restore_memory(&self, state: &Path) -> Result<()> {
        run_checked(self.virsh().arg("restore").arg(state).arg("--running"))
    }
}

fn parse_domain_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses `virsh domblklist --details`, keeping disks with a real source.
fn parse_domblklist(output: &str) -> Vec<BlockDevice> {
    let mut devices = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0] == "Type" || fields[0].starts_with('-') {
            continue;
        }
        if fields[1] != "disk" {
            continue;
        }
        let source = fields[3..].join(" ");
        if source == "-" {
            continue;
        }
        devices.push(BlockDevice::new(fields[2], source));
    }
    devices
}

/// Finds `<label>: <number> [unit]` in key/value style virsh output.
fn parse_labeled_number(output: &str, label: &str) -> Option<u64> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != label {
            return None;
        }
        value.split_whitespace().next()?.parse().ok()
    })
}

/// Parses `virsh blockjob --info`, e.g. `Block Copy: [ 45 %]`.
fn parse_blockjob(output: &str) -> JobProgress {
    let text = output.trim();
    if text.is_empty() || text.starts_with("No current block job") {
        return JobProgress::NoJob;
    }
    let percent = text
        .split_once('[')
        .and_then(|(_, rest)| rest.split_once('%'))
        .map(|(number, _)| number.trim())
        .and_then(|number| number.split('.').next())
        .and_then(|whole| whole.trim().parse::<u8>().ok());
    match percent {
        Some(p) => JobProgress::Percent(p.min(100)),
        None => JobProgress::Unreadable(text.to_string()),
    }
}
