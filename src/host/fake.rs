//! In-memory host used by pipeline and scheduler tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use crate::error::{BackupError, HostError, Result};
use crate::host::{BlockDevice, JobProgress, VirtHost};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DomainState {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeDomain {
    pub devices: Vec<BlockDevice>,
    pub allocation: u64,
    pub memory: u64,
    pub defined: bool,
    pub state: DomainState,
}

#[derive(Default)]
pub(crate) struct FakeHost {
    domains: RefCell<BTreeMap<String, FakeDomain>>,
    calls: RefCell<Vec<String>>,
    failures: RefCell<HashSet<(String, String)>>,
    progress: RefCell<HashMap<(String, String), VecDeque<JobProgress>>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a running, defined domain with a single qcow2 disk.
    pub fn with_domain(self, name: &str) -> Self {
        let image = format!("/images/{}.qcow2", name);
        self.add_domain(name, vec![BlockDevice::new("vda", image)]);
        self
    }

    pub fn add_domain(&self, name: &str, devices: Vec<BlockDevice>) {
        self.domains.borrow_mut().insert(
            name.to_string(),
            FakeDomain {
                devices,
                allocation: 4096,
                memory: 8192,
                defined: true,
                state: DomainState::Running,
            },
        );
    }

    pub fn set_sizes(&self, name: &str, allocation: u64, memory: u64) {
        if let Some(domain) = self.domains.borrow_mut().get_mut(name) {
            domain.allocation = allocation;
            domain.memory = memory;
        }
    }

    /// Makes `op` fail for `domain` from now on.
    pub fn fail(&self, op: &str, domain: &str) {
        self.failures
            .borrow_mut()
            .insert((op.to_string(), domain.to_string()));
    }

    /// Samples returned by successive progress polls; defaults to 50%, 100%.
    pub fn script_progress(&self, domain: &str, device: &str, samples: Vec<JobProgress>) {
        self.progress
            .borrow_mut()
            .insert((domain.to_string(), device.to_string()), samples.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn domain(&self, name: &str) -> Option<FakeDomain> {
        self.domains.borrow().get(name).cloned()
    }

    fn record(&self, op: &str, domain: &str) -> Result<()> {
        self.calls.borrow_mut().push(format!("{} {}", op, domain));
        if self
            .failures
            .borrow()
            .contains(&(op.to_string(), domain.to_string()))
        {
            return Err(HostError::CommandFailed(format!("virsh {} {}: injected failure", op, domain)).into());
        }
        if !self.domains.borrow().contains_key(domain) {
            return Err(HostError::CommandFailed(format!("domain {} not found", domain)).into());
        }
        Ok(())
    }

    fn update(&self, domain: &str, f: impl FnOnce(&mut FakeDomain)) {
        if let Some(d) = self.domains.borrow_mut().get_mut(domain) {
            f(d);
        }
    }
}

fn read_domain_name(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path)
        .map_err(|e| BackupError::message(format!("read {}: {}", path.display(), e)))?;
    let name = text
        .split_once("<name>")
        .and_then(|(_, rest)| rest.split_once("</name>"))
        .map(|(name, _)| name.to_string())
        .ok_or_else(|| HostError::Parse(format!("{}: no <name>", path.display())))?;
    Ok(name)
}

impl VirtHost for FakeHost {
    fn list_domains(&self) -> Result<Vec<String>> {
        Ok(self.domains.borrow().keys().cloned().collect())
    }

    fn block_devices(&self, domain: &str) -> Result<Vec<BlockDevice>> {
        self.record("domblklist", domain)?;
        Ok(self.domain(domain).map(|d| d.devices).unwrap_or_default())
    }

    fn device_allocation(&self, domain: &str, _device: &BlockDevice) -> Result<u64> {
        self.record("domblkinfo", domain)?;
        Ok(self.domain(domain).map(|d| d.allocation).unwrap_or(0))
    }

    fn memory_size(&self, domain: &str) -> Result<u64> {
        self.record("dominfo", domain)?;
        Ok(self.domain(domain).map(|d| d.memory).unwrap_or(0))
    }

    fn dump_definition(&self, domain: &str, dest: &Path) -> Result<()> {
        self.record("dumpxml", domain)?;
        fs::write(dest, format!("<domain><name>{}</name></domain>\n", domain))?;
        Ok(())
    }

    fn undefine(&self, domain: &str) -> Result<()> {
        self.record("undefine", domain)?;
        self.update(domain, |d| d.defined = false);
        Ok(())
    }

    fn define(&self, definition: &Path) -> Result<()> {
        let domain = read_domain_name(definition)?;
        self.record("define", &domain)?;
        self.update(&domain, |d| d.defined = true);
        Ok(())
    }

    fn suspend(&self, domain: &str) -> Result<()> {
        self.record("suspend", domain)?;
        self.update(domain, |d| d.state = DomainState::Paused);
        Ok(())
    }

    fn resume(&self, domain: &str) -> Result<()> {
        self.record("resume", domain)?;
        self.update(domain, |d| d.state = DomainState::Running);
        Ok(())
    }

    fn start_block_copy(&self, domain: &str, device: &BlockDevice, dest: &Path) -> Result<()> {
        self.record(&format!("blockcopy:{}", device.target), domain)?;
        fs::write(dest, b"disk image")?;
        Ok(())
    }

    fn block_job_progress(&self, domain: &str, device: &BlockDevice) -> Result<JobProgress> {
        self.record(&format!("blockjob:{}", device.target), domain)?;
        let key = (domain.to_string(), device.target.clone());
        let mut progress = self.progress.borrow_mut();
        let samples = progress
            .entry(key)
            .or_insert_with(|| vec![JobProgress::Percent(50), JobProgress::Percent(100)].into());
        Ok(samples.pop_front().unwrap_or(JobProgress::NoJob))
    }

    fn finish_block_copy(&self, domain: &str, device: &BlockDevice) -> Result<()> {
        self.record(&format!("finish:{}", device.target), domain)
    }

    fn abort_block_copy(&self, domain: &str, device: &BlockDevice) -> Result<()> {
        self.record(&format!("abort:{}", device.target), domain)
    }

    fn save_memory(&self, domain: &str, dest: &Path) -> Result<()> {
        self.record("save", domain)?;
        fs::write(dest, format!("<name>{}</name>\n", domain))?;
        self.update(domain, |d| d.state = DomainState::Stopped);
        Ok(())
    }

    fn restore_memory(&self, state: &Path) -> Result<()> {
        let domain = read_domain_name(state)?;
        self.record("restore", &domain)?;
        self.update(&domain, |d| d.state = DomainState::Running);
        Ok(())
    }
}
