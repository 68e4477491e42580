use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{BackupError, Result};

/// Pid-file lock keeping a second run away from the checkpoint and the
/// backup volume. Removed on drop, but only by the process that wrote it.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.path);
    }
}

/// Lock file guarding runs that share `checkpoint`.
pub fn lock_path_for(checkpoint: &Path) -> PathBuf {
    let mut name = checkpoint.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

const ACQUIRE_ATTEMPTS: usize = 3;

/// Who the lock file says holds the lock.
#[derive(Debug, PartialEq, Eq)]
enum Holder {
    /// The file went away between the create attempt and the read.
    Gone,
    Alive(i32),
    /// Unreadable pid or a process that no longer exists.
    Stale,
}

/// Returns `Ok(None)` when a live process already holds the lock.
pub fn acquire(path: &Path) -> Result<Option<RunLock>> {
    let failed = |e: io::Error| BackupError::message(format!("failed to lock {}: {}", path.display(), e));
    for _ in 0..ACQUIRE_ATTEMPTS {
        if create_lock(path).map_err(failed)? {
            debug!(lock = %path.display(), "lock acquired");
            return Ok(Some(RunLock {
                path: path.to_path_buf(),
            }));
        }
        match holder(path).map_err(failed)? {
            Holder::Alive(pid) => {
                debug!(lock = %path.display(), pid, "lock held");
                return Ok(None);
            }
            Holder::Gone => {}
            Holder::Stale => {
                warn!(lock = %path.display(), "removing stale lock");
                remove_if_present(path).map_err(failed)?;
            }
        }
    }
    Ok(None)
}

/// `Ok(false)` when the file already exists.
fn create_lock(path: &Path) -> io::Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => return Err(err),
    };
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;
    Ok(true)
}

fn holder(path: &Path) -> io::Result<Holder> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Holder::Gone),
        Err(err) => return Err(err),
    };
    Ok(match text.trim().parse::<i32>() {
        Ok(pid) if pid > 0 && process_alive(pid) => Holder::Alive(pid),
        _ => Holder::Stale,
    })
}

fn process_alive(pid: i32) -> bool {
    // Signal 0 only checks that the pid exists; EPERM means it does but
    // belongs to someone else.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn unlock_file(path: &Path) -> io::Result<()> {
    if fs::read_to_string(path)?.trim() == std::process::id().to_string() {
        fs::remove_file(path)?;
    }
    Ok(())
}
