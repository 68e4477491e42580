//! Pre-flight disk space check for one target backup.
//!
//! Advisory only: nothing is reserved, the backup volume is assumed to be
//! used by this tool alone.

use crate::backup::rotation::RotationPlan;
use crate::error::Result;
use crate::host::{BlockDevice, VirtHost};
use crate::util::paths::disk_usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceEstimate {
    /// Sum of the devices' host allocations.
    pub devices: u64,
    /// Memory size with the safety margin applied.
    pub memory: u64,
    /// Space rotation gives back before the copy lands.
    pub reclaimable: u64,
}

impl SpaceEstimate {
    pub fn new(allocations: &[u64], memory: u64, margin_percent: u32, reclaimable: u64) -> Self {
        Self {
            devices: allocations.iter().fold(0u64, |acc, a| acc.saturating_add(*a)),
            memory: scale(memory, margin_percent),
            reclaimable,
        }
    }

    pub fn required(&self) -> u64 {
        self.devices
            .saturating_add(self.memory)
            .saturating_sub(self.reclaimable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub ok: bool,
    pub free: u64,
    pub required: u64,
    pub free_after: u64,
}

/// `memory * percent / 100`, rounded up.
fn scale(memory: u64, percent: u32) -> u64 {
    let scaled = (u128::from(memory) * u128::from(percent) + 99) / 100;
    scaled.min(u128::from(u64::MAX)) as u64
}

pub fn check(free: u64, estimate: &SpaceEstimate) -> AdmissionDecision {
    let required = estimate.required();
    AdmissionDecision {
        ok: free >= required,
        free,
        required,
        free_after: free.saturating_sub(required),
    }
}

/// Asks the host for the sizes the backup of `domain` will write.
pub fn estimate<H: VirtHost + ?Sized>(
    host: &H,
    domain: &str,
    devices: &[BlockDevice],
    margin_percent: u32,
    plan: &RotationPlan,
) -> Result<SpaceEstimate> {
    let mut allocations = Vec::with_capacity(devices.len());
    for device in devices {
        allocations.push(host.device_allocation(domain, device)?);
    }
    let memory = host.memory_size(domain)?;
    let mut reclaimable: u64 = 0;
    for dir in plan.reclaimed() {
        reclaimable = reclaimable.saturating_add(disk_usage(&dir)?);
    }
    Ok(SpaceEstimate::new(&allocations, memory, margin_percent, reclaimable))
}
