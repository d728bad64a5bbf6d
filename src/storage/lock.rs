//! Advisory file locks.
//!
//! Every key maps to `locks/<key>.lock`. Multi-key requests are sorted and
//! de-duplicated before acquisition, so two callers with overlapping key sets
//! always contend in the same order and cannot deadlock. Guards unlock on
//! drop; a multi-key guard unlocks in reverse acquisition order.
//!
//! Each acquisition opens its own file handle, so threads of one process
//! contend with each other exactly like separate processes do.

use super::{durable, Result, StorageError};
use fs2::FileExt;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default sleep between lock attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Hands out file-backed locks rooted at one directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    poll_interval: Duration,
}

/// A held lock on a single key.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    file: File,
}

impl LockGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(key = %self.key, error = %e, "failed to release lock");
        }
        debug!(key = %self.key, "released lock");
    }
}

/// Locks on several keys, held in sorted order.
#[derive(Debug)]
pub struct MultiLockGuard {
    guards: Vec<LockGuard>,
}

impl MultiLockGuard {
    /// Keys held, in acquisition order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.guards.iter().map(LockGuard::key)
    }

    /// Returns true if `key` is held by this guard.
    #[must_use]
    pub fn covers(&self, key: &str) -> bool {
        self.guards.iter().any(|g| g.key == key)
    }
}

impl Drop for MultiLockGuard {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= 200
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && !key.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey {
            key: key.to_string(),
        })
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl LockManager {
    /// Creates a manager storing lock files in `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.lock"))
    }

    fn try_lock(&self, key: &str) -> Result<Option<LockGuard>> {
        let path = self.lock_path(key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StorageError::io("open_lock", &path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(key, "acquired lock");
                Ok(Some(LockGuard {
                    key: key.to_string(),
                    file,
                }))
            }
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(StorageError::io("lock", &path, e)),
        }
    }

    fn acquire_until(&self, key: &str, deadline: Instant, started: Instant) -> Result<LockGuard> {
        loop {
            if let Some(guard) = self.try_lock(key)? {
                return Ok(guard);
            }
            let now = Instant::now();
            if now >= deadline {
                let waited_ms = u64::try_from(now.duration_since(started).as_millis())
                    .unwrap_or(u64::MAX);
                return Err(StorageError::LockTimeout {
                    key: key.to_string(),
                    waited_ms,
                });
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// Acquires one key, waiting at most `timeout`.
    ///
    /// # Errors
    /// Returns [`StorageError::LockTimeout`] when the deadline passes, or an
    /// I/O error if the lock file cannot be opened.
    pub fn acquire(&self, key: &str, timeout: Duration) -> Result<LockGuard> {
        validate_key(key)?;
        durable::ensure_dir(&self.dir)?;
        let started = Instant::now();
        self.acquire_until(key, started + timeout, started)
    }

    /// Acquires every key in lexicographic order under one overall deadline.
    ///
    /// Keys acquired before a failure are released in reverse order before
    /// the error is returned.
    ///
    /// # Errors
    /// Returns [`StorageError::LockTimeout`] naming the key that could not be
    /// taken, or an I/O error.
    pub fn acquire_many<I, S>(&self, keys: I, timeout: Duration) -> Result<MultiLockGuard>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ordered: BTreeSet<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
        for key in &ordered {
            validate_key(key)?;
        }
        durable::ensure_dir(&self.dir)?;

        let started = Instant::now();
        let deadline = started + timeout;
        let mut held = MultiLockGuard {
            guards: Vec::with_capacity(ordered.len()),
        };
        for key in &ordered {
            match self.acquire_until(key, deadline, started) {
                Ok(guard) => held.guards.push(guard),
                Err(e) => {
                    debug!(key = %key, held = held.guards.len(), "multi-lock failed; releasing");
                    drop(held);
                    return Err(e);
                }
            }
        }
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Barrier};

    fn manager(dir: &Path) -> LockManager {
        LockManager::new(dir.join("locks")).with_poll_interval(Duration::from_millis(1))
    }

    #[test]
    fn second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let _held = locks.acquire("tasks.t1", Duration::from_millis(10)).unwrap();
        let err = locks
            .acquire("tasks.t1", Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { ref key, .. } if key == "tasks.t1"));
    }

    #[test]
    fn drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        drop(locks.acquire("index", Duration::from_millis(10)).unwrap());
        assert!(locks.acquire("index", Duration::ZERO).is_ok());
    }

    #[test]
    fn multi_lock_sorts_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let guard = locks
            .acquire_many(["tasks.b", "events.b", "tasks.b", "events._global"], Duration::from_millis(10))
            .unwrap();
        let keys: Vec<&str> = guard.keys().collect();
        assert_eq!(keys, vec!["events._global", "events.b", "tasks.b"]);
        assert!(guard.covers("events.b"));
        assert!(!guard.covers("index"));
    }

    #[test]
    fn partial_failure_releases_acquired_keys() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let _blocker = locks.acquire("zzz", Duration::from_millis(10)).unwrap();
        let err = locks
            .acquire_many(["aaa", "mmm", "zzz"], Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { ref key, .. } if key == "zzz"));

        // Both earlier keys must be free again.
        let again = locks.acquire_many(["aaa", "mmm"], Duration::ZERO).unwrap();
        assert_eq!(again.keys().count(), 2);
    }

    #[test]
    fn invalid_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        assert!(matches!(
            locks.acquire("../escape", Duration::ZERO),
            Err(StorageError::InvalidKey { .. })
        ));
        assert!(matches!(
            locks.acquire_many(["ok", "has/slash"], Duration::ZERO),
            Err(StorageError::InvalidKey { .. })
        ));
    }

    #[test]
    fn contended_lock_is_granted_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());
        let held = locks.acquire("events.t1", Duration::ZERO).unwrap();

        let waiter = {
            let locks = locks.clone();
            std::thread::spawn(move || locks.acquire("events.t1", Duration::from_secs(5)).is_ok())
        };
        std::thread::sleep(Duration::from_millis(30));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn overlapping_multi_locks_never_deadlock(
            sets in prop::collection::vec(
                prop::collection::vec(prop::sample::select(vec!["a", "b", "c", "d", "e"]), 1..5),
                2..6,
            )
        ) {
            let dir = tempfile::tempdir().unwrap();
            let locks = manager(dir.path());
            let barrier = Arc::new(Barrier::new(sets.len()));

            let handles: Vec<_> = sets
                .into_iter()
                .map(|mut keys| {
                    // Callers hand keys over in arbitrary order.
                    keys.reverse();
                    let locks = locks.clone();
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        let guard = locks.acquire_many(keys, Duration::from_secs(10))?;
                        std::thread::sleep(Duration::from_millis(1));
                        drop(guard);
                        Ok::<(), StorageError>(())
                    })
                })
                .collect();

            for handle in handles {
                let outcome = handle.join().expect("worker panicked");
                prop_assert!(outcome.is_ok(), "worker failed: {:?}", outcome);
            }
        }
    }
}
