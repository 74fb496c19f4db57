use fs2::FileExt;
use libherokubuildpack::log::log_warning;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use std::{fmt, io};

/// How long a cloak/uncloak operation will wait for another loader to finish
/// renaming the same package's artifacts before skipping that artifact.
pub(crate) const CLOAK_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an activation will wait for a concurrent builder to finish
/// creating the same bubble. Covers a full staged install of a large package.
pub(crate) const INSTALL_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The subdirectory of the bubble root holding every lock file.
pub(crate) const LOCKS_DIR_NAME: &str = ".locks";

/// An exclusive advisory lock on a file, released on drop.
///
/// Lock files are never deleted once created; only the advisory lock state
/// matters, so a leftover file from a crashed process is harmless and the
/// next acquirer simply locks it again.
#[derive(Debug)]
pub(crate) struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Acquire the lock at `path`, polling until `timeout` has elapsed.
    /// Acquisition always has a finite deadline; hitting it is a recoverable
    /// error, not a panic.
    pub(crate) fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockAcquireError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|io_error| LockAcquireError::Io {
                path: path.to_path_buf(),
                io_error,
            })?;
        }
        let file = File::create(path).map_err(|io_error| LockAcquireError::Io {
            path: path.to_path_buf(),
            io_error,
        })?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(error) if is_lock_contention(&error) => {
                    if Instant::now() >= deadline {
                        return Err(LockAcquireError::Timeout {
                            path: path.to_path_buf(),
                            waited: timeout,
                        });
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(io_error) => {
                    return Err(LockAcquireError::Io {
                        path: path.to_path_buf(),
                        io_error,
                    });
                }
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(error) = fs2::FileExt::unlock(&self.file) {
            log_warning(
                "Lock release failed",
                format!("Failed to unlock {}: {error}", self.path.display()),
            );
        }
    }
}

fn is_lock_contention(error: &io::Error) -> bool {
    error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Errors that can occur when acquiring a file lock.
#[derive(Debug)]
pub enum LockAcquireError {
    Io { path: PathBuf, io_error: io::Error },
    Timeout { path: PathBuf, waited: Duration },
}

impl fmt::Display for LockAcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, io_error } => {
                write!(f, "I/O error on lock file {}: {io_error}", path.display())
            }
            Self::Timeout { path, waited } => write!(
                f,
                "timed out after {waited:?} waiting for lock {}",
                path.display()
            ),
        }
    }
}

/// Hands out the per-package and per-identity file locks, all named
/// deterministically inside the `.locks` subdirectory of the bubble root so
/// that every process contending for the same resource agrees on the path.
#[derive(Clone, Debug)]
pub(crate) struct LockManager {
    locks_dir: PathBuf,
}

impl LockManager {
    pub(crate) fn new(bubble_root: &Path) -> Self {
        Self {
            locks_dir: bubble_root.join(LOCKS_DIR_NAME),
        }
    }

    /// Serializes cloak/uncloak operations on one package across processes.
    pub(crate) fn cloak_lock(&self, canonical_name: &str) -> Result<LockFile, LockAcquireError> {
        LockFile::acquire(
            &self.locks_dir.join(format!("cloak-{canonical_name}.lock")),
            CLOAK_LOCK_TIMEOUT,
        )
    }

    /// Prevents concurrent bubble creation for one `(name, version)` identity.
    /// The loser of the race waits here and then observes the winner's bubble.
    pub(crate) fn install_lock(
        &self,
        canonical_name: &str,
        version: &crate::version::Version,
    ) -> Result<LockFile, LockAcquireError> {
        LockFile::acquire(
            &self
                .locks_dir
                .join(format!("install-{canonical_name}-{version}.lock")),
            INSTALL_LOCK_TIMEOUT,
        )
    }
}

/// A re-entrant in-process lock serializing cloak-list mutation between
/// threads of one interpreter-managing process. The owning thread may lock
/// again without deadlocking; other threads block until every guard from the
/// owner has been dropped.
#[derive(Debug, Default)]
pub(crate) struct ReentrantLock {
    state: Mutex<OwnerState>,
    released: Condvar,
}

#[derive(Debug, Default)]
struct OwnerState {
    owner: Option<ThreadId>,
    depth: usize,
}

impl ReentrantLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> ReentrantGuard<'_> {
        let current = thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(|poisoned| {
            // A panic while holding the guard leaves the state consistent
            // (owner/depth were updated before the guard was handed out).
            poisoned.into_inner()
        });
        while state.owner.is_some_and(|owner| owner != current) {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.owner = Some(current);
        state.depth += 1;
        ReentrantGuard { lock: self }
    }
}

pub(crate) struct ReentrantGuard<'a> {
    lock: &'a ReentrantLock,
}

impl Drop for ReentrantGuard<'_> {
    fn drop(&mut self) {
        let mut state = self
            .lock
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.lock.released.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn lock_file_acquire_and_release() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("test.lock");
        let first = LockFile::acquire(&path, Duration::from_secs(1)).unwrap();
        drop(first);
        // Released on drop, so a second acquisition succeeds immediately.
        LockFile::acquire(&path, Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn lock_file_times_out_while_held() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("held.lock");
        let _held = LockFile::acquire(&path, Duration::from_secs(1)).unwrap();

        // fs2 locks are per file handle, so a second handle in the same
        // process contends just like another process would.
        let path_clone = path.clone();
        let result = thread::spawn(move || {
            LockFile::acquire(&path_clone, Duration::from_millis(200))
        })
        .join()
        .unwrap();
        assert!(matches!(
            result.unwrap_err(),
            LockAcquireError::Timeout { waited, .. } if waited == Duration::from_millis(200)
        ));
    }

    #[test]
    fn lock_manager_paths_are_deterministic() {
        let manager = LockManager::new(Path::new("/tmp/bubbles"));
        assert_eq!(
            manager.locks_dir,
            Path::new("/tmp/bubbles").join(LOCKS_DIR_NAME)
        );
    }

    #[test]
    fn reentrant_lock_allows_nested_acquisition() {
        let lock = ReentrantLock::new();
        let _outer = lock.lock();
        let _inner = lock.lock();
    }

    #[test]
    fn reentrant_lock_blocks_other_threads() {
        let lock = Arc::new(ReentrantLock::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let guard = lock.lock();
        let worker = {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                let _guard = lock.lock();
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        drop(guard);
        worker.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
