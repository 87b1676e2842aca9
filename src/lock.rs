//! Advisory locks backed by the shared database.
//!
//! A lock is a row in `advisory_locks` keyed by `(namespace, key)`. Rows are
//! written through a connection owned by the [`LockManager`], never through
//! the [`Store`](crate::store::Store) connection doing the protected work, so
//! the protected work may commit as often as it likes without releasing the
//! lock.
//!
//! Acquisition is a single conditional upsert: it succeeds when no row
//! exists, or when the existing row's lease has expired. Rows held by a
//! process that no longer exists are cleared before the attempt, which gives
//! the lock session semantics: a crashed holder never wedges an agent.
//!
//! Every acquisition attempt writes its own holder token, and release
//! deletes the row only if it still carries that token. Releasing a lock
//! that is not held is a no-op, so release is issued on every exit path,
//! including the timeout path of a blocking acquire, even when several
//! threads share one manager.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{AgentId, to_millis};
use crate::store::open_connection;

/// Namespace for per-agent locks.
pub const AGENT_NAMESPACE: i64 = 1;

const MAX_POLL: Duration = Duration::from_millis(250);

/// Identifies one lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub namespace: i64,
    pub key: i64,
}

impl LockKey {
    pub fn agent(id: AgentId) -> Self {
        Self {
            namespace: AGENT_NAMESPACE,
            key: id,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.namespace, self.key)
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock {key}")]
    Timeout { key: LockKey, waited: Duration },

    #[error("lock {key} is already held by this thread")]
    Reentrant { key: LockKey },

    #[error("lock store error: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Tuning for lock acquisition.
#[derive(Debug, Clone)]
pub struct LockSettings {
    /// Rows older than this are considered abandoned.
    pub lease: Duration,
    /// Initial delay between blocking attempts; doubles up to 250ms.
    pub poll_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(300),
            poll_interval: Duration::from_millis(25),
        }
    }
}

thread_local! {
    static HELD: RefCell<HashSet<(PathBuf, LockKey)>> = RefCell::new(HashSet::new());
}

/// Owns the dedicated lock connection and this caller's holder identity.
pub struct LockManager {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    holder: String,
    attempts: AtomicU64,
    pid: u32,
    settings: LockSettings,
}

impl LockManager {
    pub fn open(path: &Path, settings: LockSettings) -> rusqlite::Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS advisory_locks (
                namespace INTEGER NOT NULL,
                key INTEGER NOT NULL,
                holder TEXT NOT NULL,
                pid INTEGER NOT NULL,
                acquired_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, key)
            );",
        )?;
        let pid = std::process::id();
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
            holder: format!("{pid}:{}", uuid::Uuid::new_v4()),
            attempts: AtomicU64::new(0),
            pid,
            settings,
        })
    }

    /// Prefix shared by every token this manager writes.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn mint_token(&self) -> String {
        let n = self.attempts.fetch_add(1, Ordering::Relaxed);
        format!("{}:{n}", self.holder)
    }

    /// Wait up to `timeout` for the lock.
    pub fn acquire(&self, key: LockKey, timeout: Duration) -> Result<LockGuard<'_>, LockError> {
        self.check_reentrancy(key)?;
        let token = self.mint_token();
        let started = Instant::now();
        let mut delay = self.settings.poll_interval;

        loop {
            match self.try_insert(key, &token) {
                Ok(true) => return Ok(self.guard(key, token)),
                Ok(false) => {}
                Err(e) => {
                    self.release_row(key, &token);
                    return Err(e.into());
                }
            }

            let waited = started.elapsed();
            if waited >= timeout {
                // The last attempt may have committed even though we saw a
                // failure; the token-scoped delete covers that case.
                self.release_row(key, &token);
                warn!(key = %key, waited_ms = waited.as_millis() as u64, "lock acquire timed out");
                return Err(LockError::Timeout { key, waited });
            }

            let remaining = timeout - waited;
            std::thread::sleep(delay.min(remaining));
            delay = (delay * 2).min(MAX_POLL);
        }
    }

    /// Take the lock if it is free right now. `Ok(None)` means busy.
    pub fn try_acquire(&self, key: LockKey) -> Result<Option<LockGuard<'_>>, LockError> {
        self.check_reentrancy(key)?;
        let token = self.mint_token();
        match self.try_insert(key, &token) {
            Ok(true) => Ok(Some(self.guard(key, token))),
            Ok(false) => {
                debug!(key = %key, "lock busy");
                Ok(None)
            }
            Err(e) => {
                self.release_row(key, &token);
                Err(e.into())
            }
        }
    }

    /// True if any caller currently holds a live row for `key`.
    pub fn is_locked(&self, key: LockKey) -> Result<bool, LockError> {
        let conn = self.connection();
        let now = to_millis(Utc::now());
        let held: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM advisory_locks WHERE namespace = ?1 AND key = ?2 AND expires_at >= ?3",
                params![key.namespace, key.key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(held.is_some())
    }

    fn check_reentrancy(&self, key: LockKey) -> Result<(), LockError> {
        let held = HELD.with(|held| held.borrow().contains(&(self.db_path.clone(), key)));
        if held {
            return Err(LockError::Reentrant { key });
        }
        Ok(())
    }

    fn guard(&self, key: LockKey, token: String) -> LockGuard<'_> {
        HELD.with(|held| held.borrow_mut().insert((self.db_path.clone(), key)));
        debug!(key = %key, holder = %token, "lock acquired");
        LockGuard {
            manager: self,
            key,
            token,
            released: false,
        }
    }

    fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_insert(&self, key: LockKey, token: &str) -> rusqlite::Result<bool> {
        let conn = self.connection();
        clear_orphan(&conn, key, self.pid)?;

        let now = to_millis(Utc::now());
        let lease_ms = i64::try_from(self.settings.lease.as_millis()).unwrap_or(i64::MAX);
        let changed = conn.execute(
            "INSERT INTO advisory_locks (namespace, key, holder, pid, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(namespace, key) DO UPDATE SET
                 holder = excluded.holder,
                 pid = excluded.pid,
                 acquired_at = excluded.acquired_at,
                 expires_at = excluded.expires_at
             WHERE advisory_locks.expires_at < excluded.acquired_at",
            params![
                key.namespace,
                key.key,
                token,
                i64::from(self.pid),
                now,
                now.saturating_add(lease_ms),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Token-scoped delete; a no-op unless `token` holds `key`.
    fn release_row(&self, key: LockKey, token: &str) {
        let conn = self.connection();
        if let Err(e) = conn.execute(
            "DELETE FROM advisory_locks WHERE namespace = ?1 AND key = ?2 AND holder = ?3",
            params![key.namespace, key.key, token],
        ) {
            warn!(key = %key, error = %e, "lock release failed; lease will expire");
        }
    }
}

/// Held lock. Dropping it releases the row.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    key: LockKey,
    token: String,
    released: bool,
}

impl fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard<'_> {
    pub fn key(&self) -> LockKey {
        self.key
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.manager.release_row(self.key, &self.token);
        HELD.with(|held| {
            held.borrow_mut()
                .remove(&(self.manager.db_path.clone(), self.key))
        });
        debug!(key = %self.key, "lock released");
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Remove a row whose holding process is gone.
fn clear_orphan(conn: &Connection, key: LockKey, own_pid: u32) -> rusqlite::Result<()> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT holder, pid FROM advisory_locks WHERE namespace = ?1 AND key = ?2",
            params![key.namespace, key.key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((holder, pid)) = row else {
        return Ok(());
    };
    let Ok(pid) = u32::try_from(pid) else {
        return Ok(());
    };
    if pid == own_pid || process_alive(pid) {
        return Ok(());
    }

    let removed = conn.execute(
        "DELETE FROM advisory_locks WHERE namespace = ?1 AND key = ?2 AND holder = ?3",
        params![key.namespace, key.key, holder],
    )?;
    if removed > 0 {
        warn!(key = %key, holder = %holder, "cleared lock held by exited process");
    }
    Ok(())
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence/permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
