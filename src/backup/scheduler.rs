//! Drives target backups within a wall-clock budget and keeps the cycle's
//! progress in the checkpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::backup::checkpoint::CheckpointStore;
use crate::backup::pipeline::{BackupOutcome, BackupRunner};
use crate::error::Result;
use crate::targets::Target;
use crate::types::{FailurePolicy, TargetFailure, TargetId};

/// Live targets merged with the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// Live targets plus completed ones that have since disappeared.
    pub all: BTreeSet<TargetId>,
    pub completed: BTreeSet<TargetId>,
    /// Completed targets no longer present in the live set.
    pub removed: usize,
    /// The checkpoint covered every target and a new cycle begins.
    pub cycle_restarted: bool,
}

impl Reconciled {
    pub fn pending(&self) -> impl Iterator<Item = &TargetId> {
        self.all.difference(&self.completed)
    }
}

/// Merges the live target set with recorded completions. When the recorded
/// set already covers everything the cycle is over, which `reset_on_complete`
/// turns into an actual checkpoint reset.
pub fn reconcile(
    store: &CheckpointStore,
    live: &BTreeSet<TargetId>,
    reset_on_complete: bool,
) -> Result<Reconciled> {
    if !store.exists() {
        info!(checkpoint = %store.path().display(), "checkpoint not found; starting from the beginning");
        return Ok(Reconciled {
            all: live.clone(),
            completed: BTreeSet::new(),
            removed: 0,
            cycle_restarted: false,
        });
    }

    let completed = store.load()?;
    let all: BTreeSet<TargetId> = live.union(&completed).cloned().collect();
    let removed = completed.difference(live).count();

    if completed.is_superset(&all) {
        info!(checkpoint = %store.path().display(), "all targets were backed up; starting a new cycle");
        if reset_on_complete {
            store.reset()?;
        }
        return Ok(Reconciled {
            all: live.clone(),
            completed: BTreeSet::new(),
            removed: 0,
            cycle_restarted: true,
        });
    }

    if removed > 0 {
        info!(
            done = completed.len(),
            total = all.len(),
            removed,
            "checkpoint found; some backed up targets were removed since; continuing"
        );
    } else {
        info!(done = completed.len(), total = all.len(), "checkpoint found; continuing");
    }
    Ok(Reconciled {
        all,
        completed,
        removed,
        cycle_restarted: false,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub ran_this_run: usize,
    pub total_completed: usize,
    pub total_targets: usize,
    pub removed: usize,
    pub timed_out: bool,
    pub failed: Vec<(TargetId, TargetFailure)>,
    /// The target whose failure stopped the run early.
    pub aborted: Option<(TargetId, TargetFailure)>,
}

impl RunReport {
    pub fn cycle_complete(&self) -> bool {
        self.total_completed == self.total_targets
    }
}

pub struct Scheduler<'a, R: BackupRunner + ?Sized> {
    runner: &'a R,
    store: CheckpointStore,
    policy: FailurePolicy,
}

impl<'a, R: BackupRunner + ?Sized> Scheduler<'a, R> {
    pub fn new(runner: &'a R, store: CheckpointStore, policy: FailurePolicy) -> Self {
        Self {
            runner,
            store,
            policy,
        }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Backs up pending targets until done, out of time, or aborted. The
    /// time limit is only checked before a target starts; a backup in
    /// flight always runs to its end.
    pub fn run(&self, targets: &[Target], time_limit: Duration, start_over: bool) -> Result<RunReport> {
        info!(count = targets.len(), "targets found");
        let by_id: BTreeMap<&TargetId, &Target> = targets.iter().map(|t| (&t.id, t)).collect();
        let live: BTreeSet<TargetId> = by_id.keys().map(|id| (*id).clone()).collect();

        let mut state = if start_over {
            info!("starting over");
            self.store.reset()?;
            Reconciled {
                all: live,
                completed: BTreeSet::new(),
                removed: 0,
                cycle_restarted: true,
            }
        } else {
            reconcile(&self.store, &live, true)?
        };

        let pending: Vec<TargetId> = state.pending().cloned().collect();
        let mut report = RunReport {
            total_targets: state.all.len(),
            removed: state.removed,
            ..RunReport::default()
        };

        let start = Instant::now();
        for id in pending {
            if start.elapsed() >= time_limit {
                report.timed_out = true;
                break;
            }
            // Pending ids always come from the live set: completed removed
            // targets are never pending.
            let Some(target) = by_id.get(&id) else {
                continue;
            };
            match self.runner.backup(target)? {
                BackupOutcome::Success => {
                    self.store.append(&id)?;
                    state.completed.insert(id);
                    report.ran_this_run += 1;
                }
                BackupOutcome::Failed(failure) => {
                    error!(vm = %id, step = %failure.step, reason = %failure.reason, "target not backed up");
                    if failure.step.aborts_run() || self.policy == FailurePolicy::Abort {
                        report.aborted = Some((id, failure));
                        break;
                    }
                    report.failed.push((id, failure));
                }
            }
        }

        report.total_completed = state.completed.len();
        if report.timed_out {
            info!("time limit reached");
        } else if let Some((id, failure)) = &report.aborted {
            warn!(vm = %id, %failure, "run aborted");
        } else if report.cycle_complete() {
            info!("finished backing up all targets");
        } else {
            warn!(failed = report.failed.len(), "finished with failed targets");
        }
        info!(count = report.ran_this_run, "backed up this run");
        info!(
            done = report.total_completed,
            total = report.total_targets,
            "backed up in total"
        );
        Ok(report)
    }
}
