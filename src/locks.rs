use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock busy: {}", .0.display())]
    Busy(PathBuf),
    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exclusive writer lock backed by a `create_new` file holding the owner pid.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    _file: File,
}

impl FileLock {
    /// Polls until the lock is free or `timeout` elapses. A lock file older
    /// than `stale_after` is treated as abandoned and removed once.
    pub fn acquire(
        path: &Path,
        timeout: Duration,
        stale_after: Duration,
    ) -> Result<Self, LockError> {
        let start = Instant::now();
        let mut reclaimed = false;
        loop {
            match try_acquire(path)? {
                Some(guard) => return Ok(guard),
                None if !reclaimed && is_stale(path, stale_after) => {
                    reclaimed = true;
                    warn!(
                        path = %path.display(),
                        holder = ?holder_pid(path),
                        "removing stale write lock"
                    );
                    remove_lock(path)?;
                }
                None if start.elapsed() >= timeout => {
                    return Err(LockError::Busy(path.to_path_buf()));
                }
                None => thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    pub fn try_acquire(path: &Path) -> Result<Option<Self>, LockError> {
        try_acquire(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn try_acquire(path: &Path) -> Result<Option<FileLock>, LockError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            writeln!(file, "{}", std::process::id())?;
            Ok(Some(FileLock {
                path: path.to_path_buf(),
                _file: file,
            }))
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(LockError::Io(err)),
    }
}

/// Age of an existing lock file, `None` when nobody holds it.
pub fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}

pub fn is_stale(path: &Path, stale_after: Duration) -> bool {
    lock_age(path).is_some_and(|age| age >= stale_after)
}

pub fn holder_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn remove_lock(path: &Path) -> Result<(), LockError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(LockError::Io(err)),
    }
}
