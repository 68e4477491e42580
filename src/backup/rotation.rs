//! Fixed-depth ring of backup generations for one target.
//!
//! Generations live in `<target-dir>/gen.<i>`, 0 being the newest. A
//! directory only counts as a generation worth deleting when it holds the
//! exported definition ([`DEFINITION_FILE`]); eviction renames the oldest one
//! to a staging name first so a reader never sees a half-shifted ring.
//!
//! A failed backup kept for inspection carries [`INCOMPLETE_FILE`]. It is
//! not a generation: the next rotation deletes it and reuses its slot
//! instead of shifting it over a good one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{BackupError, Result};

pub const DEFINITION_FILE: &str = "domain.xml";
pub const INCOMPLETE_FILE: &str = "INCOMPLETE";
const GENERATION_PREFIX: &str = "gen.";
const STAGING_NAME: &str = "gen.evicting";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Absent,
    Present { marker: bool },
    /// Left behind by a failed backup; counts as free.
    Incomplete,
}

impl SlotState {
    pub fn is_present(&self) -> bool {
        matches!(self, SlotState::Present { .. })
    }
}

/// Snapshot of a target's generation slots, taken once and then applied.
#[derive(Debug, Clone)]
pub struct RotationPlan {
    target_dir: PathBuf,
    slots: Vec<SlotState>,
    staging: SlotState,
}

pub fn generation_dir(target_dir: &Path, index: usize) -> PathBuf {
    target_dir.join(format!("{}{}", GENERATION_PREFIX, index))
}

fn inspect_slot(path: &Path) -> Result<SlotState> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() && path.join(INCOMPLETE_FILE).is_file() => {
            Ok(SlotState::Incomplete)
        }
        Ok(meta) if meta.is_dir() => Ok(SlotState::Present {
            marker: path.join(DEFINITION_FILE).is_file(),
        }),
        Ok(_) => Err(BackupError::message(format!(
            "{} exists but is not a generation directory",
            path.display()
        ))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(SlotState::Absent),
        Err(err) => Err(BackupError::message(format!("stat {}: {}", path.display(), err))),
    }
}

impl RotationPlan {
    pub fn inspect(target_dir: &Path, depth: usize) -> Result<Self> {
        if depth == 0 {
            return Err(BackupError::message("generation depth must be at least 1"));
        }
        let mut slots = Vec::with_capacity(depth);
        for index in 0..depth {
            slots.push(inspect_slot(&generation_dir(target_dir, index))?);
        }
        let staging = inspect_slot(&target_dir.join(STAGING_NAME))?;
        Ok(Self {
            target_dir: target_dir.to_path_buf(),
            slots,
            staging,
        })
    }

    pub fn slots(&self) -> &[SlotState] {
        &self.slots
    }

    /// Every slot is taken, so the oldest generation has to go.
    fn evicts(&self) -> bool {
        self.slots.iter().all(SlotState::is_present)
    }

    /// Directory rotation will delete to make room, if any.
    pub fn evicted(&self) -> Option<PathBuf> {
        if self.evicts() {
            Some(generation_dir(&self.target_dir, self.slots.len() - 1))
        } else {
            None
        }
    }

    fn incomplete(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| **slot == SlotState::Incomplete)
            .map(|(index, _)| generation_dir(&self.target_dir, index))
    }

    /// Every directory `apply` deletes: incomplete leftovers and the evicted
    /// generation.
    pub fn reclaimed(&self) -> Vec<PathBuf> {
        self.incomplete().chain(self.evicted()).collect()
    }

    /// Shifts the ring and returns the fresh, empty generation 0 directory.
    /// Nothing is touched when a directory due for deletion lacks the marker.
    pub fn apply(&self) -> Result<PathBuf> {
        let depth = self.slots.len();
        let staging = self.target_dir.join(STAGING_NAME);
        if self.staging == (SlotState::Present { marker: false }) {
            return Err(BackupError::message(format!(
                "refusing to delete {}: {} missing",
                staging.display(),
                DEFINITION_FILE
            )));
        }
        if self.evicts() && self.slots[depth - 1] == (SlotState::Present { marker: false }) {
            return Err(BackupError::message(format!(
                "refusing to evict {}: {} missing",
                generation_dir(&self.target_dir, depth - 1).display(),
                DEFINITION_FILE
            )));
        }

        if self.staging != SlotState::Absent {
            debug!(path = %staging.display(), "removing leftover staging directory");
            remove_generation(&staging)?;
        }
        for leftover in self.incomplete() {
            info!(path = %leftover.display(), "removing incomplete generation");
            remove_generation(&leftover)?;
        }
        fs::create_dir_all(&self.target_dir).map_err(|e| {
            BackupError::message(format!("create {}: {}", self.target_dir.display(), e))
        })?;

        let shift = match self.slots.iter().position(|slot| !slot.is_present()) {
            Some(gap) => gap,
            None => {
                let oldest = generation_dir(&self.target_dir, depth - 1);
                rename(&oldest, &staging)?;
                depth - 1
            }
        };
        for index in (0..shift).rev() {
            rename(
                &generation_dir(&self.target_dir, index),
                &generation_dir(&self.target_dir, index + 1),
            )?;
        }

        let fresh = generation_dir(&self.target_dir, 0);
        fs::create_dir(&fresh)
            .map_err(|e| BackupError::message(format!("create {}: {}", fresh.display(), e)))?;

        if self.evicts() {
            info!(path = %staging.display(), "evicting oldest generation");
            remove_generation(&staging)?;
        }
        Ok(fresh)
    }
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    debug!(from = %from.display(), to = %to.display(), "shift generation");
    fs::rename(from, to).map_err(|e| {
        BackupError::message(format!("rename {} -> {}: {}", from.display(), to.display(), e))
    })
}

fn remove_generation(path: &Path) -> Result<()> {
    if !path.join(DEFINITION_FILE).is_file() && !path.join(INCOMPLETE_FILE).is_file() {
        return Err(BackupError::message(format!(
            "refusing to delete {}: {} missing",
            path.display(),
            DEFINITION_FILE
        )));
    }
    fs::remove_dir_all(path)
        .map_err(|e| BackupError::message(format!("delete {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_generation(target_dir: &Path, index: usize, tag: &str, marker: bool) {
        let dir = generation_dir(target_dir, index);
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("tag"), tag).expect("write tag");
        if marker {
            fs::write(dir.join(DEFINITION_FILE), "<domain/>").expect("write marker");
        }
    }

    fn tag(target_dir: &Path, index: usize) -> Option<String> {
        fs::read_to_string(generation_dir(target_dir, index).join("tag")).ok()
    }

    #[test]
    fn first_rotation_creates_generation_zero() {
        let root = tempfile::tempdir().expect("tempdir");
        let target = root.path().join("web");
        let plan = RotationPlan::inspect(&target, 2).expect("inspect");
        assert_eq!(plan.slots(), &[SlotState::Absent, SlotState::Absent]);
        assert_eq!(plan.evicted(), None);
        let fresh = plan.apply().expect("rotate");
        assert_eq!(fresh, generation_dir(&target, 0));
        assert!(fresh.is_dir());
        assert_eq!(fs::read_dir(&fresh).expect("read").count(), 0);
    }

    #[test]
    fn rotation_shifts_without_evicting_when_room_remains() {
        let root = tempfile::tempdir().expect("tempdir");
        let target = root.path().join("web");
        make_generation(&target, 0, "newest", true);
        let plan = RotationPlan::inspect(&target, 2).expect("inspect");
        assert_eq!(plan.evicted(), None);
        plan.apply().expect("rotate");
        assert_eq!(tag(&target, 1).as_deref(), Some("newest"));
        assert_eq!(tag(&target, 0), None);
    }

    #[test]
    fn full_ring_evicts_oldest() {
        let root = tempfile::tempdir().expect("tempdir");
        let target = root.path().join("web");
        make_generation(&target, 0, "newest", true);
        make_generation(&target, 1, "oldest", true);
        let plan = RotationPlan::inspect(&target, 2).expect("inspect");
        assert_eq!(plan.evicted(), Some(generation_dir(&target, 1)));
        plan.apply().expect("rotate");
        assert_eq!(tag(&target, 1).as_deref(), Some("newest"));
        assert!(generation_dir(&target, 0).is_dir());
        assert!(!generation_dir(&target, 2).exists());
        assert!(!target.join(STAGING_NAME).exists());
    }

    #[test]
    fn depth_one_replaces_the_only_generation() {
        let root = tempfile::tempdir().expect("tempdir");
        let target = root.path().join("web");
        make_generation(&target, 0, "old", true);
        RotationPlan::inspect(&target, 1)
            .expect("inspect")
            .apply()
            .expect("rotate");
        assert_eq!(tag(&target, 0), None);
        assert!(generation_dir(&target, 0).is_dir());
    }

    #[test]
    fn gap_in_ring_absorbs_the_shift() {
        let root = tempfile::tempdir().expect("tempdir");
        let target = root.path().join("web");
        make_generation(&target, 0, "a", true);
        make_generation(&target, 2, "c", true);
        let plan = RotationPlan::inspect(&target, 3).expect("inspect");
        assert_eq!(plan.evicted(), None);
        plan.apply().expect("rotate");
        assert_eq!(tag(&target, 1).as_deref(), Some("a"));
        assert_eq!(tag(&target, 2).as_deref(), Some("c"));
    }

    #[test]
    fn eviction_without_marker_aborts_and_keeps_everything() {
        let root = tempfile::tempdir().expect("tempdir");
        let target = root.path().join("web");
        make_generation(&target, 0, "newest", true);
        make_generation(&target, 1, "not-a-backup", false);
        let plan = RotationPlan::inspect(&target, 2).expect("inspect");
        assert_eq!(plan.slots()[1], SlotState::Present { marker: false });
        let err = plan.apply().unwrap_err().to_string();
        assert!(err.contains("refusing to evict"), "{}", err);
        assert_eq!(tag(&target, 0).as_deref(), Some("newest"));
        assert_eq!(tag(&target, 1).as_deref(), Some("not-a-backup"));
    }

    #[test]
    fn leftover_staging_directory_is_cleared() {
        let root = tempfile::tempdir().expect("tempdir");
        let target = root.path().join("web");
        let staging = target.join(STAGING_NAME);
        fs::create_dir_all(&staging).expect("mkdir");
        fs::write(staging.join(DEFINITION_FILE), "<domain/>").expect("marker");
        RotationPlan::inspect(&target, 2)
            .expect("inspect")
            .apply()
            .expect("rotate");
        assert!(!staging.exists());

        fs::create_dir_all(&staging).expect("mkdir");
        let err = RotationPlan::inspect(&target, 2)
            .expect("inspect")
            .apply()
            .unwrap_err();
        assert!(err.to_string().contains("refusing to delete"));
        assert!(staging.exists());
    }

    #[test]
    fn incomplete_generation_is_replaced_not_shifted() {
        let root = tempfile::tempdir().expect("tempdir");
        let target = root.path().join("web");
        make_generation(&target, 0, "partial", true);
        fs::write(generation_dir(&target, 0).join(INCOMPLETE_FILE), "").expect("marker");
        make_generation(&target, 1, "good", true);

        let plan = RotationPlan::inspect(&target, 2).expect("inspect");
        assert_eq!(plan.slots()[0], SlotState::Incomplete);
        assert_eq!(plan.evicted(), None);
        assert_eq!(plan.reclaimed(), vec![generation_dir(&target, 0)]);
        let fresh = plan.apply().expect("rotate");
        assert_eq!(fs::read_dir(&fresh).expect("read").count(), 0);
        assert_eq!(tag(&target, 1).as_deref(), Some("good"));
    }

    #[test]
    fn incomplete_generation_without_definition_is_removable() {
        let root = tempfile::tempdir().expect("tempdir");
        let target = root.path().join("web");
        make_generation(&target, 0, "partial", false);
        fs::write(generation_dir(&target, 0).join(INCOMPLETE_FILE), "").expect("marker");
        RotationPlan::inspect(&target, 1)
            .expect("inspect")
            .apply()
            .expect("rotate");
        assert_eq!(tag(&target, 0), None);
    }

    #[test]
    fn stray_file_in_slot_is_rejected() {
        let root = tempfile::tempdir().expect("tempdir");
        let target = root.path().join("web");
        fs::create_dir_all(&target).expect("mkdir");
        fs::write(generation_dir(&target, 0), "file").expect("write");
        assert!(RotationPlan::inspect(&target, 2).is_err());
        assert!(RotationPlan::inspect(&target, 0).is_err());
    }
}
