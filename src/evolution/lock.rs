//! Evolution locking
//!
//! Reconciliation and execution for one (database, schema, meta table) triple
//! are serialized by two locks taken in order:
//!
//! 1. an in-process lock from [`LockManager`], so threads of the same process
//!    queue up without hammering the database;
//! 2. a database advisory lock on the connection, so other processes are kept
//!    out as well.
//!
//! Both waits share one timeout. The guard releases both on drop, whatever
//! the exit path.

use crate::database::Connection;
use crate::evolution::error::EvolutionError;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Default lock wait
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between advisory lock attempts
const POLL_INTERVAL: Duration = Duration::from_millis(100);

static GLOBAL_LOCKS: Lazy<LockManager> = Lazy::new(LockManager::new);

/// The triple a lock is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub database: String,
    pub schema: String,
    pub meta_table: String,
}

impl LockKey {
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        meta_table: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            schema: schema.into(),
            meta_table: meta_table.into(),
        }
    }

    /// Key handed to the database's advisory lock primitive
    pub fn advisory_key(&self) -> String {
        format!(
            "evolutions:{}:{}:{}",
            self.database, self.schema, self.meta_table
        )
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.schema.is_empty() {
            write!(f, "{}/{}", self.database, self.meta_table)
        } else {
            write!(f, "{}/{}.{}", self.database, self.schema, self.meta_table)
        }
    }
}

/// Registry of keys held by this process
#[derive(Default)]
pub struct LockManager {
    held: Mutex<HashSet<LockKey>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide manager
    pub fn global() -> &'static LockManager {
        &GLOBAL_LOCKS
    }

    /// Whether this process currently holds `key`
    pub fn is_held(&self, key: &LockKey) -> bool {
        self.held.lock().contains(key)
    }

    /// Acquire the in-process lock, then the connection's advisory lock
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if either lock is not obtained within `timeout`,
    /// and `Storage` if the advisory lock query itself fails.
    pub fn acquire<'a>(
        &'a self,
        connection: &'a dyn Connection,
        key: LockKey,
        timeout: Duration,
    ) -> Result<EvolutionLockGuard<'a>, EvolutionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::lock_span(&key.to_string()).entered();

        let start = Instant::now();
        let process = self.acquire_local(key, start, timeout)?;

        let advisory_key = process.key.advisory_key();
        loop {
            match connection.try_advisory_lock(&advisory_key) {
                Ok(true) => break,
                Ok(false) => {
                    log::debug!("Advisory lock {advisory_key} is held by another session, waiting");
                }
                Err(e) => {
                    return Err(EvolutionError::Storage(format!(
                        "failed to acquire advisory lock {advisory_key}: {e}"
                    )));
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(EvolutionError::LockTimeout {
                    key: process.key.clone(),
                    waited: elapsed,
                });
            }
            std::thread::sleep(POLL_INTERVAL.min(timeout - elapsed));
        }

        #[cfg(feature = "metrics")]
        METRICS.observe_lock_wait(start.elapsed());
        log::debug!("Acquired evolutions lock on {}", process.key);

        Ok(EvolutionLockGuard {
            connection,
            advisory_key,
            process,
        })
    }

    /// Run `body` while holding the lock for `key`
    pub fn with_lock<T>(
        &self,
        connection: &dyn Connection,
        key: LockKey,
        timeout: Duration,
        body: impl FnOnce() -> Result<T, EvolutionError>,
    ) -> Result<T, EvolutionError> {
        let _guard = self.acquire(connection, key, timeout)?;
        body()
    }

    fn acquire_local(
        &self,
        key: LockKey,
        start: Instant,
        timeout: Duration,
    ) -> Result<ProcessLock<'_>, EvolutionError> {
        let mut held = self.held.lock();
        while held.contains(&key) {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(EvolutionError::LockTimeout { key, waited: elapsed });
            }
            // spurious wakeups just loop around
            self.released.wait_for(&mut held, timeout - elapsed);
        }
        held.insert(key.clone());

        Ok(ProcessLock { manager: self, key })
    }
}

/// In-process half of the lock
struct ProcessLock<'a> {
    manager: &'a LockManager,
    key: LockKey,
}

impl Drop for ProcessLock<'_> {
    fn drop(&mut self) {
        self.manager.held.lock().remove(&self.key);
        self.manager.released.notify_all();
    }
}

/// Held evolutions lock; releases the advisory lock, then the in-process lock
pub struct EvolutionLockGuard<'a> {
    connection: &'a dyn Connection,
    advisory_key: String,
    process: ProcessLock<'a>,
}

impl EvolutionLockGuard<'_> {
    pub fn key(&self) -> &LockKey {
        &self.process.key
    }
}

impl Drop for EvolutionLockGuard<'_> {
    fn drop(&mut self) {
        // the session ends soon anyway, which also frees the advisory lock
        if let Err(e) = self.connection.advisory_unlock(&self.advisory_key) {
            log::warn!("Failed to release advisory lock {}: {e}", self.advisory_key);
        }
        log::debug!("Released evolutions lock on {}", self.process.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryDatabase;
    use crate::database::Database;
    use std::sync::Arc;

    fn key() -> LockKey {
        LockKey::new("default", "", "play_evolutions")
    }

    #[test]
    fn test_guard_releases_both_locks() {
        let db = MemoryDatabase::new("default");
        let conn = db.connect().unwrap();
        let locks = LockManager::new();

        {
            let guard = locks.acquire(conn.as_ref(), key(), Duration::from_secs(1)).unwrap();
            assert_eq!(guard.key(), &key());
            assert!(locks.is_held(&key()));
            assert!(db.is_advisory_locked(&key().advisory_key()));
        }

        assert!(!locks.is_held(&key()));
        assert!(!db.is_advisory_locked(&key().advisory_key()));
    }

    #[test]
    fn test_second_acquire_times_out() {
        let db = MemoryDatabase::new("default");
        let first = db.connect().unwrap();
        let second = db.connect().unwrap();
        let locks = LockManager::new();

        let _held = locks.acquire(first.as_ref(), key(), Duration::from_secs(1)).unwrap();
        let err = locks
            .acquire(second.as_ref(), key(), Duration::from_millis(50))
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_advisory_lock_held_elsewhere_times_out() {
        let db = MemoryDatabase::new("default");
        let other_process = db.connect().unwrap();
        assert!(other_process.try_advisory_lock(&key().advisory_key()).unwrap());

        // a fresh manager stands in for a different process
        let conn = db.connect().unwrap();
        let locks = LockManager::new();
        let err = locks
            .acquire(conn.as_ref(), key(), Duration::from_millis(150))
            .unwrap_err();
        assert!(matches!(err, EvolutionError::LockTimeout { .. }));
        // the in-process half was released on the error path
        assert!(!locks.is_held(&key()));
    }

    #[test]
    fn test_distinct_keys_do_not_contend() {
        let db = MemoryDatabase::new("default");
        let conn = db.connect().unwrap();
        let locks = LockManager::new();

        let _a = locks.acquire(conn.as_ref(), key(), Duration::from_millis(10)).unwrap();
        let _b = locks
            .acquire(
                conn.as_ref(),
                LockKey::new("default", "audit", "play_evolutions"),
                Duration::from_millis(10),
            )
            .unwrap();
    }

    #[test]
    fn test_waiter_proceeds_after_release() {
        let db = MemoryDatabase::new("default");
        let locks = Arc::new(LockManager::new());

        let first = db.connect().unwrap();
        let guard = locks.acquire(first.as_ref(), key(), Duration::from_secs(1)).unwrap();

        let waiter = {
            let db = db.clone();
            let locks = Arc::clone(&locks);
            std::thread::spawn(move || {
                let conn = db.connect().unwrap();
                locks
                    .with_lock(conn.as_ref(), key(), Duration::from_secs(5), || Ok(()))
                    .is_ok()
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert!(waiter.join().unwrap());
    }
}
