//! Advisory owner lock kept in a sibling `<name>.lock` file.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Path of the lock file belonging to a backing file.
    pub fn lock_path(data_path: &Path) -> PathBuf {
        let mut name = data_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("mvcc"));
        name.push(".lock");
        data_path.with_file_name(name)
    }

    /// Locks the lock file next to `data_path`, failing immediately if another
    /// process holds it. The lock file records the holder's process ID.
    pub fn acquire(data_path: &Path) -> Result<Self> {
        let path = Self::lock_path(data_path);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::io(&path, "open lock file", e))?;

        Self::try_lock(&file).map_err(Error::LockError)?;

        file.set_len(0)
            .and_then(|_| writeln!(file, "{}", std::process::id()))
            .and_then(|_| file.flush())
            .map_err(|e| Error::io(&path, "write lock file", e))?;

        tracing::debug!(path = %path.display(), "Acquired owner lock");
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

    #[cfg(windows)]
    fn try_lock(file: &File) -> io::Result<()> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::minwinbase::OVERLAPPED;
        use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

        let handle = file.as_raw_handle();
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let result = unsafe {
            LockFileEx(
                handle as *mut _,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                !0,
                !0,
                &mut overlapped,
            )
        };

        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock. The file stays behind so a
        // racing creator never locks an unlinked inode.
        tracing::debug!(path = %self.path.display(), "Released owner lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_lock_path_is_sibling() {
        let path = FileLock::lock_path(Path::new("/tmp/grid/store.db"));
        assert_eq!(path, PathBuf::from("/tmp/grid/store.db.lock"));
    }

    #[test]
    fn test_lock_records_pid() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("store.db");

        let lock = FileLock::acquire(&data).expect("Failed to acquire lock");
        let content = fs::read_to_string(lock.path()).expect("Failed to read lock file");
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_double_lock() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("store.db");

        let _first = FileLock::acquire(&data).expect("Failed to acquire first lock");
        let second = FileLock::acquire(&data);
        assert!(matches!(second, Err(Error::LockError(_))));
    }

    #[test]
    fn test_auto_unlock_on_drop() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("store.db");

        {
            let _lock = FileLock::acquire(&data).expect("Failed to acquire lock");
        }

        let _again = FileLock::acquire(&data).expect("Should reacquire after drop");
    }
}
