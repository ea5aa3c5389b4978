use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

/// Exclusive advisory lock on a file inside the database directory.
///
/// The lock lives as long as the handle; dropping it closes the descriptor,
/// which releases the lock.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Takes the lock, failing with `DbOpenedByOthers` if another handle holds it.
    /// The lock file records the owning process id.
    pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Truncating before the lock would erase the holder's pid.
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        if let Err(e) = Self::try_lock(&file) {
            if e.kind() == io::ErrorKind::WouldBlock {
                return Err(Error::DbOpenedByOthers(path));
            }
            return Err(e.into());
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = dir.path().join("LOCK");

        let lock = FileLock::lock(&lock_path).expect("Failed to acquire lock");
        assert_eq!(lock.path(), lock_path.as_path());

        let content = fs::read_to_string(&lock_path).expect("Failed to read lock file");
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_double_lock() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = dir.path().join("LOCK");

        let _lock1 = FileLock::lock(&lock_path).expect("Failed to acquire first lock");
        let lock2 = FileLock::lock(&lock_path);

        assert!(matches!(lock2, Err(Error::DbOpenedByOthers(p)) if p == lock_path));
    }

    #[test]
    fn test_auto_unlock_on_drop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = dir.path().join("LOCK");

        {
            let _lock = FileLock::lock(&lock_path).expect("Failed to acquire lock");
        }

        let _lock2 = FileLock::lock(&lock_path).expect("Should be able to acquire lock after drop");
    }
}
