/// System module: filesystem status queries used by scanning, authentication and caching

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use nix::unistd::{self, AccessFlags};

/// Logging macros for convenient access
/// Now use the log crate directly for target-aware routing
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        log::info!("{}", msg);
    }}
}

/// Ownership and permission bits of a filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStatus {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub is_dir: bool,
}

impl FileStatus {
    pub fn is_group_or_other_writable(&self) -> bool {
        let mask = (libc::S_IWGRP | libc::S_IWOTH) as u32;
        self.mode & mask != 0
    }
}

/// Stat a path, following symlinks.
pub fn stat(path: &Path) -> io::Result<FileStatus> {
    use std::os::unix::fs::MetadataExt;

    let metadata = fs::metadata(path)?;
    Ok(FileStatus {
        uid: metadata.uid(),
        gid: metadata.gid(),
        mode: metadata.mode(),
        is_dir: metadata.is_dir(),
    })
}

/// Whether the calling process may write to `path`.
pub fn is_writable(path: &Path) -> bool {
    unistd::access(path, AccessFlags::W_OK).is_ok()
}

/// uid and gid of the calling process.
pub fn current_owner() -> (u32, u32) {
    (unistd::getuid().as_raw(), unistd::getgid().as_raw())
}

/// Modification time in whole seconds since the epoch.
pub fn mtime_secs(path: &Path) -> io::Result<i64> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(match modified.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    })
}

/// Set the modification time of a regular file, in whole seconds.
pub fn set_mtime_secs(path: &Path, secs: i64) -> io::Result<()> {
    let when = if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    };
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_modified(when)
}
