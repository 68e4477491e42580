//! Backup of a single target into a fresh generation.
//!
//! Steps run strictly in order; the first failing step ends the target's
//! backup. Once the definition has been detached it is always re-attached,
//! whatever happened in between.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::backup::admission::{self, AdmissionDecision};
use crate::backup::rotation::{RotationPlan, DEFINITION_FILE, INCOMPLETE_FILE};
use crate::error::Result;
use crate::host::{BlockDevice, JobProgress, VirtHost};
use crate::targets::Target;
use crate::types::{FailedGenerationPolicy, FailedStep, TargetFailure};
use crate::util::paths::free_space;

pub const MEMORY_STATE_FILE: &str = "memory.state";
const QUARANTINE_PREFIX: &str = "failed-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Success,
    Failed(TargetFailure),
}

/// Something that backs up one target. `Err` means the whole run must stop.
pub trait BackupRunner {
    fn backup(&self, target: &Target) -> Result<BackupOutcome>;
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub backup_dir: PathBuf,
    pub generations: usize,
    pub memory_margin_percent: u32,
    pub poll_interval: Duration,
    pub max_poll_failures: u32,
    pub failed_generation: FailedGenerationPolicy,
}

pub struct Pipeline<'a, H: VirtHost + ?Sized> {
    host: &'a H,
    settings: PipelineSettings,
}

type StepResult = std::result::Result<(), TargetFailure>;

impl<'a, H: VirtHost + ?Sized> Pipeline<'a, H> {
    pub fn new(host: &'a H, settings: PipelineSettings) -> Self {
        Self { host, settings }
    }

    pub fn target_dir(&self, target: &Target) -> PathBuf {
        self.settings.backup_dir.join(target.id.dir_name())
    }

    fn eligible_devices(&self, domain: &str) -> std::result::Result<Vec<BlockDevice>, TargetFailure> {
        let devices = self
            .host
            .block_devices(domain)
            .map_err(|e| TargetFailure::new(FailedStep::Enumeration, e))?;
        let (eligible, skipped): (Vec<_>, Vec<_>) = devices
            .into_iter()
            .partition(|device| device.format.supports_live_snapshot());
        for device in &skipped {
            info!(
                domain,
                device = %device.target,
                format = %device.format,
                "skipping device without live snapshot support"
            );
        }
        if eligible.is_empty() {
            warn!(domain, "no snapshot-capable devices");
        }
        Ok(eligible)
    }

    fn admit(
        &self,
        domain: &str,
        devices: &[BlockDevice],
        plan: &RotationPlan,
    ) -> Result<std::result::Result<AdmissionDecision, TargetFailure>> {
        let estimate = match admission::estimate(
            self.host,
            domain,
            devices,
            self.settings.memory_margin_percent,
            plan,
        ) {
            Ok(estimate) => estimate,
            Err(e) => return Ok(Err(TargetFailure::new(FailedStep::Admission, e))),
        };
        let free = free_space(&self.settings.backup_dir)?;
        let decision = admission::check(free, &estimate);
        info!(
            domain,
            devices = estimate.devices,
            memory = estimate.memory,
            reclaimable = estimate.reclaimable,
            required = decision.required,
            free = decision.free,
            "disk space check"
        );
        if decision.ok {
            Ok(Ok(decision))
        } else {
            Ok(Err(TargetFailure::new(
                FailedStep::Admission,
                format!(
                    "insufficient space in {}: {} bytes required, {} free",
                    self.settings.backup_dir.display(),
                    decision.required,
                    decision.free
                ),
            )))
        }
    }

    /// Polls one device copy to 100% and ends the job. Every failure after
    /// the copy started tries to abort the job.
    fn copy_device(&self, domain: &str, device: &BlockDevice, gen_dir: &Path) -> StepResult {
        let dest = gen_dir.join(device.backup_file_name());
        info!(domain, device = %device.target, dest = %dest.display(), "copying device");
        self.host
            .start_block_copy(domain, device, &dest)
            .map_err(|e| TargetFailure::new(FailedStep::Copy, e))?;

        let mut failures = 0u32;
        let mut last = None;
        loop {
            let sample = match self.host.block_job_progress(domain, device) {
                Ok(sample) => sample,
                Err(e) => JobProgress::Unreadable(e.to_string()),
            };
            match sample {
                JobProgress::Percent(percent) => {
                    failures = 0;
                    if last != Some(percent) {
                        info!(domain, device = %device.target, percent, "copy progress");
                        last = Some(percent);
                    }
                    if percent >= 100 {
                        break;
                    }
                }
                JobProgress::NoJob => {
                    self.abort_copy(domain, device);
                    return Err(TargetFailure::new(
                        FailedStep::Copy,
                        format!("{}: copy job disappeared", device.target),
                    ));
                }
                JobProgress::Unreadable(detail) => {
                    failures += 1;
                    warn!(domain, device = %device.target, attempt = failures, detail = %detail, "unreadable copy progress");
                    if failures >= self.settings.max_poll_failures {
                        self.abort_copy(domain, device);
                        return Err(TargetFailure::new(
                            FailedStep::Copy,
                            format!(
                                "{}: no readable progress after {} polls",
                                device.target, failures
                            ),
                        ));
                    }
                }
            }
            thread::sleep(self.settings.poll_interval);
        }

        self.host
            .finish_block_copy(domain, device)
            .map_err(|e| TargetFailure::new(FailedStep::Copy, e))
    }

    fn abort_copy(&self, domain: &str, device: &BlockDevice) {
        if let Err(e) = self.host.abort_block_copy(domain, device) {
            warn!(domain, device = %device.target, error = %e, "failed to abort copy job");
        }
    }

    /// Suspend, capture memory, and bring the target back to running.
    fn capture_memory(&self, domain: &str, gen_dir: &Path) -> StepResult {
        self.host
            .suspend(domain)
            .map_err(|e| TargetFailure::new(FailedStep::Suspend, e))?;
        let state = gen_dir.join(MEMORY_STATE_FILE);
        info!(domain, dest = %state.display(), "capturing memory state");
        if let Err(e) = self.host.save_memory(domain, &state) {
            if let Err(resume) = self.host.resume(domain) {
                error!(domain, error = %resume, "failed to resume after failed memory capture");
            }
            return Err(TargetFailure::new(FailedStep::Capture, e));
        }
        self.host
            .restore_memory(&state)
            .map_err(|e| TargetFailure::new(FailedStep::Capture, format!("resume: {}", e)))
    }

    /// Steps 4 to 9 inside the freshly rotated generation directory.
    fn populate(&self, domain: &str, devices: &[BlockDevice], gen_dir: &Path) -> StepResult {
        let definition = gen_dir.join(DEFINITION_FILE);
        self.host
            .dump_definition(domain, &definition)
            .map_err(|e| TargetFailure::new(FailedStep::Export, e))?;
        self.host
            .undefine(domain)
            .map_err(|e| TargetFailure::new(FailedStep::Detach, e))?;

        let staged = devices
            .iter()
            .try_for_each(|device| self.copy_device(domain, device, gen_dir))
            .and_then(|()| self.capture_memory(domain, gen_dir));

        let restored = self.host.define(&definition).map_err(|e| {
            error!(
                domain,
                definition = %definition.display(),
                error = %e,
                "target left without a persistent definition; define it from the backup"
            );
            TargetFailure::new(FailedStep::Restore, e)
        });
        staged.and(restored)
    }

    /// A generation that may hold the only copy of the definition (the
    /// restore step failed) or of the guest's memory (captured but never
    /// resumed) is quarantined whatever the policy says.
    fn dispose_failed_generation(&self, gen_dir: &Path, failure: &TargetFailure) {
        let irreplaceable =
            failure.step == FailedStep::Restore || gen_dir.join(MEMORY_STATE_FILE).exists();
        let policy = if irreplaceable {
            FailedGenerationPolicy::Quarantine
        } else {
            self.settings.failed_generation
        };
        match policy {
            FailedGenerationPolicy::Keep => {
                info!(path = %gen_dir.display(), "keeping incomplete generation");
                mark_incomplete(gen_dir, failure);
            }
            FailedGenerationPolicy::Delete => {
                info!(path = %gen_dir.display(), "deleting incomplete generation");
                if let Err(e) = fs::remove_dir_all(gen_dir) {
                    warn!(path = %gen_dir.display(), error = %e, "could not delete incomplete generation");
                    mark_incomplete(gen_dir, failure);
                }
            }
            FailedGenerationPolicy::Quarantine => match quarantine(gen_dir) {
                Ok(dest) => {
                    let held = gen_dir.parent().map(count_quarantined).unwrap_or(0);
                    warn!(
                        path = %dest.display(),
                        quarantined = held,
                        "incomplete generation quarantined; it is never rotated, remove it once inspected"
                    );
                }
                Err(e) => {
                    warn!(path = %gen_dir.display(), error = %e, "could not quarantine incomplete generation");
                    mark_incomplete(gen_dir, failure);
                }
            },
        }
    }

    pub fn run(&self, target: &Target) -> Result<BackupOutcome> {
        let domain = target.domain.as_str();
        info!(vm = %target.id, domain, "backing up");

        let devices = match self.eligible_devices(domain) {
            Ok(devices) => devices,
            Err(failure) => return Ok(BackupOutcome::Failed(failure)),
        };

        let target_dir = self.target_dir(target);
        let plan = match RotationPlan::inspect(&target_dir, self.settings.generations) {
            Ok(plan) => plan,
            Err(e) => return Ok(BackupOutcome::Failed(TargetFailure::new(FailedStep::Rotation, e))),
        };
        if let Err(failure) = self.admit(domain, &devices, &plan)? {
            return Ok(BackupOutcome::Failed(failure));
        }

        let gen_dir = match plan.apply() {
            Ok(dir) => dir,
            Err(e) => return Ok(BackupOutcome::Failed(TargetFailure::new(FailedStep::Rotation, e))),
        };
        debug!(vm = %target.id, path = %gen_dir.display(), "new generation");

        match self.populate(domain, &devices, &gen_dir) {
            Ok(()) => {
                info!(vm = %target.id, path = %gen_dir.display(), "backup complete");
                Ok(BackupOutcome::Success)
            }
            Err(failure) => {
                error!(vm = %target.id, step = %failure.step, reason = %failure.reason, "backup failed");
                self.dispose_failed_generation(&gen_dir, &failure);
                Ok(BackupOutcome::Failed(failure))
            }
        }
    }
}

/// Flags a failed generation left in the ring so rotation reuses its slot.
fn mark_incomplete(gen_dir: &Path, failure: &TargetFailure) {
    if let Err(e) = fs::write(gen_dir.join(INCOMPLETE_FILE), format!("{}\n", failure)) {
        warn!(path = %gen_dir.display(), error = %e, "could not mark generation incomplete");
    }
}

/// Moves `gen_dir` next to the ring as `failed-<timestamp>`, with a counter
/// appended when that name is taken.
fn quarantine(gen_dir: &Path) -> io::Result<PathBuf> {
    let stamp = Local::now().format("%Y%m%d%H%M%S").to_string();
    let mut dest = gen_dir.with_file_name(format!("{}{}", QUARANTINE_PREFIX, stamp));
    let mut n = 1;
    while dest.exists() {
        dest = gen_dir.with_file_name(format!("{}{}-{}", QUARANTINE_PREFIX, stamp, n));
        n += 1;
    }
    fs::rename(gen_dir, &dest)?;
    Ok(dest)
}

fn count_quarantined(target_dir: &Path) -> usize {
    fs::read_dir(target_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with(QUARANTINE_PREFIX))
                .count()
        })
        .unwrap_or(0)
}

impl<'a, H: VirtHost + ?Sized> BackupRunner for Pipeline<'a, H> {
    fn backup(&self, target: &Target) -> Result<BackupOutcome> {
        self.run(target)
    }
}
