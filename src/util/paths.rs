use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{BackupError, Result};

/// Bytes available to an unprivileged writer on the volume holding `path`.
pub fn free_space(path: &Path) -> Result<u64> {
    let raw = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        BackupError::message(format!("{} contains a NUL byte", path.display()))
    })?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(raw.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(BackupError::Volume {
            path: path.to_path_buf(),
            source: std::io::Error::last_os_error(),
        });
    }
    let block_size = u128::from(stat.f_frsize.max(stat.f_bsize));
    let free = block_size.saturating_mul(u128::from(stat.f_bavail));
    Ok(free.min(u128::from(u64::MAX)) as u64)
}

/// Space actually allocated on disk below `path`, like `du -s`.
pub fn disk_usage(path: &Path) -> Result<u64> {
    let mut total: u64 = 0;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| {
            BackupError::message(format!("du {}: {}", path.display(), e))
        })?;
        let meta = entry.metadata().map_err(|e| {
            BackupError::message(format!("stat {}: {}", entry.path().display(), e))
        })?;
        total = total.saturating_add(meta.blocks().saturating_mul(512));
    }
    Ok(total)
}

/// Creates the backup root if needed and verifies it is a directory.
pub fn ensure_backup_dir(path: &Path) -> Result<()> {
    if path.exists() {
        let meta = fs::metadata(path).map_err(|source| BackupError::Volume {
            path: path.to_path_buf(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(BackupError::message(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        return Ok(());
    }
    fs::create_dir_all(path).map_err(|source| BackupError::Volume {
        path: path.to_path_buf(),
        source,
    })
}

/// Absolute form of `path` against the working directory, without touching
/// the filesystem.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()
        .map_err(|e| BackupError::message(format!("current directory: {}", e)))?;
    Ok(cwd.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn free_space_reads_existing_volume() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(free_space(dir.path()).expect("statvfs") > 0);
    }

    #[test]
    fn free_space_fails_for_missing_volume() {
        let err = free_space(Path::new("/path/not/found/vm-backup")).unwrap_err();
        assert!(matches!(err, BackupError::Volume { .. }));
    }

    #[test]
    fn disk_usage_counts_allocated_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let empty = disk_usage(dir.path()).expect("du");
        let mut file = fs::File::create(dir.path().join("data")).expect("create");
        file.write_all(&vec![7u8; 64 * 1024]).expect("write");
        file.sync_all().expect("sync");
        assert!(disk_usage(dir.path()).expect("du") >= empty + 64 * 1024);
    }

    #[test]
    fn ensure_backup_dir_rejects_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a/b");
        ensure_backup_dir(&nested).expect("create");
        assert!(nested.is_dir());
        let file = dir.path().join("file");
        fs::write(&file, b"x").expect("write");
        assert!(ensure_backup_dir(&file).is_err());
    }
}
