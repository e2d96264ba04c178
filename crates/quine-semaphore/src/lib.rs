//! A filesystem-backed counting semaphore shared across the whole process
//! tree via the data directory's lock subdirectory. The invariant is
//! "observed count < slots AND my lockfile created atomically with
//! `O_EXCL`" — not a byte-range lock, so two racing acquirers can briefly
//! both see room before one loses the `create_new` race and retries.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SemaphoreError {
    #[error("semaphore io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SemaphoreError>;

struct SemState {
    seq: u64,
}

pub struct Semaphore {
    lock_dir: PathBuf,
    session_id: String,
    slots: usize,
    state: Mutex<SemState>,
}

/// Held by the caller for the duration of one `sh` invocation; removes its
/// own lock file on drop. Idempotent — tolerates the file already being gone
/// (e.g. external cleanup, or a double-release).
pub struct SemaphoreGuard {
    path: PathBuf,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl SemaphoreGuard {
    fn release(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = %self.path.display(), "failed to release semaphore lock file"),
        }
    }

}

impl Semaphore {
    pub fn new(lock_dir: impl Into<PathBuf>, session_id: impl Into<String>, slots: usize) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            session_id: session_id.into(),
            slots: slots.max(1),
            state: Mutex::new(SemState { seq: 0 }),
        }
    }

    /// Number of currently-held lock files (a point-in-time observation;
    /// racy by construction).
    pub fn count(&self) -> Result<usize> {
        let mut n = 0usize;
        let entries = match fs::read_dir(&self.lock_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some("lock") {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Blocks (polling every second) until the slot count drops below the
    /// configured limit, then atomically stakes a claim. Emits one warning
    /// if the wait exceeds 60 seconds.
    pub async fn acquire(&self) -> Result<SemaphoreGuard> {
        fs::create_dir_all(&self.lock_dir)?;
        let start = Instant::now();
        let mut warned = false;

        loop {
            if self.count()? < self.slots {
                let name = {
                    let mut state = self.state.lock().unwrap();
                    state.seq += 1;
                    format!("{}-{}.lock", self.session_id, state.seq)
                };
                let path = self.lock_dir.join(name);
                match OpenOptions::new().write(true).create_new(true).open(&path) {
                    Ok(_) => return Ok(SemaphoreGuard { path }),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        // Lost the race; someone else claimed this exact
                        // name (monotonic counter makes this vanishingly
                        // unlikely but not impossible across processes
                        // sharing a session id) or the count observation
                        // was stale. Loop and retry.
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if !warned && start.elapsed() >= Duration::from_secs(60) {
                warn!(lock_dir = %self.lock_dir.display(), slots = self.slots, "blocked on concurrency semaphore for over 60s");
                warned = true;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // ── acquire / release ──

    #[tokio::test]
    async fn acquire_creates_one_lock_file() {
        let dir = tempdir().unwrap();
        let sem = Semaphore::new(dir.path(), "s1", 2);
        let guard = sem.acquire().await.unwrap();
        assert_eq!(sem.count().unwrap(), 1);
        drop(guard);
        assert_eq!(sem.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let dir = tempdir().unwrap();
        let sem = Semaphore::new(dir.path(), "s1", 1);
        let guard = sem.acquire().await.unwrap();
        guard.release();
        // second release (drop) must not panic or error
    }

    #[tokio::test]
    async fn respects_slot_count() {
        let dir = tempdir().unwrap();
        let sem = Semaphore::new(dir.path(), "s1", 2);
        let _g1 = sem.acquire().await.unwrap();
        let _g2 = sem.acquire().await.unwrap();
        assert_eq!(sem.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn lock_dir_created_on_first_acquire() {
        let dir = tempdir().unwrap();
        let lock_dir = dir.path().join("locks");
        assert!(!lock_dir.exists());
        let sem = Semaphore::new(&lock_dir, "s1", 1);
        let _g = sem.acquire().await.unwrap();
        assert!(lock_dir.exists());
    }

    #[test]
    fn count_on_missing_dir_is_zero() {
        let dir = tempdir().unwrap();
        let sem = Semaphore::new(dir.path().join("nope"), "s1", 1);
        assert_eq!(sem.count().unwrap(), 0);
    }
}
