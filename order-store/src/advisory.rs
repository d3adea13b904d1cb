//! Session-scoped advisory locks
//!
//! The matching pass marks every fetched candidate with an advisory lock so
//! a second (illegal) engine instance cannot pull the same orders into its
//! working set. The locks are tied to a session, not a transaction: they
//! survive across the one-trade-per-commit cycle and disappear automatically
//! when the holding session dies, which is what makes a crashed engine safe
//! to restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::error::{Error, Result};
use sqlx::{Connection, PgConnection, Row};
use tracing::debug;

/// Lock namespaces, kept disjoint by the key encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockClass {
    /// An order under consideration by a matching pass
    Order = 1,
}

/// Compose the 64-bit advisory key from a lock class and a row sequence
fn advisory_key(class: LockClass, seq: i64) -> i64 {
    ((class as i64) << 56) | (seq & 0x00ff_ffff_ffff_ffff)
}

/// Session-scoped mutual exclusion keyed by (lock class, row sequence)
#[async_trait]
pub trait AdvisoryLocks: Send + Sync {
    /// Attempt to take the lock; false when another session holds it
    async fn try_lock(&self, class: LockClass, seq: i64) -> Result<bool>;

    /// Block until the lock is acquired
    async fn lock(&self, class: LockClass, seq: i64) -> Result<()>;

    /// Release one lock; false when this session did not hold it
    async fn unlock(&self, class: LockClass, seq: i64) -> Result<bool>;

    /// Emergency cleanup: release everything this session holds
    async fn unlock_all(&self) -> Result<()>;

    /// Whether this session still holds any advisory lock
    async fn has_locks(&self) -> Result<bool>;
}

/// Shared registry backing in-memory advisory locks.
///
/// Each `session()` hands out a handle with its own session id; dropping the
/// handle releases its locks, mirroring a database connection dropping.
#[derive(Clone, Default)]
pub struct InMemoryLockRegistry {
    locks: Arc<Mutex<HashMap<i64, u64>>>,
    next_session: Arc<AtomicU64>,
}

impl InMemoryLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> InMemoryAdvisoryLocks {
        InMemoryAdvisoryLocks {
            locks: self.locks.clone(),
            session: self.next_session.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }
}

/// One in-memory lock session
pub struct InMemoryAdvisoryLocks {
    locks: Arc<Mutex<HashMap<i64, u64>>>,
    session: u64,
}

#[async_trait]
impl AdvisoryLocks for InMemoryAdvisoryLocks {
    async fn try_lock(&self, class: LockClass, seq: i64) -> Result<bool> {
        let key = advisory_key(class, seq);
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        match locks.get(&key) {
            Some(holder) => Ok(*holder == self.session),
            None => {
                locks.insert(key, self.session);
                Ok(true)
            }
        }
    }

    async fn lock(&self, class: LockClass, seq: i64) -> Result<()> {
        loop {
            if self.try_lock(class, seq).await? {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }

    async fn unlock(&self, class: LockClass, seq: i64) -> Result<bool> {
        let key = advisory_key(class, seq);
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        if locks.get(&key) == Some(&self.session) {
            locks.remove(&key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn unlock_all(&self) -> Result<()> {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        locks.retain(|_, holder| *holder != self.session);
        Ok(())
    }

    async fn has_locks(&self) -> Result<bool> {
        let locks = self.locks.lock().expect("lock registry poisoned");
        Ok(locks.values().any(|holder| *holder == self.session))
    }
}

impl Drop for InMemoryAdvisoryLocks {
    fn drop(&mut self) {
        // Session death releases its locks, like a dropped pg connection
        if let Ok(mut locks) = self.locks.lock() {
            locks.retain(|_, holder| *holder != self.session);
        }
    }
}

/// PostgreSQL advisory locks over one pinned connection.
///
/// The connection is held for the lifetime of the manager; pg ties advisory
/// locks to the backend session, so everything is released server-side if
/// the process dies.
pub struct PostgresAdvisoryLocks {
    conn: tokio::sync::Mutex<PgConnection>,
}

impl PostgresAdvisoryLocks {
    /// Open a dedicated session for advisory locking
    pub async fn connect(database_url: &str) -> Result<Self> {
        let conn = PgConnection::connect(database_url)
            .await
            .map_err(Error::Database)?;

        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }
}

#[async_trait]
impl AdvisoryLocks for PostgresAdvisoryLocks {
    async fn try_lock(&self, class: LockClass, seq: i64) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS locked")
            .bind(advisory_key(class, seq))
            .fetch_one(&mut *conn)
            .await?;
        let locked: bool = row.get("locked");
        debug!("try_lock({:?}, {}) -> {}", class, seq, locked);
        Ok(locked)
    }

    async fn lock(&self, class: LockClass, seq: i64) -> Result<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(advisory_key(class, seq))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn unlock(&self, class: LockClass, seq: i64) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let row = sqlx::query("SELECT pg_advisory_unlock($1) AS unlocked")
            .bind(advisory_key(class, seq))
            .fetch_one(&mut *conn)
            .await?;
        Ok(row.get("unlocked"))
    }

    async fn unlock_all(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query("SELECT pg_advisory_unlock_all()")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn has_locks(&self) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let row = sqlx::query(
            "SELECT count(*) AS held
             FROM pg_locks
             WHERE locktype = 'advisory' AND pid = pg_backend_pid()",
        )
        .fetch_one(&mut *conn)
        .await?;
        let held: i64 = row.get("held");
        Ok(held > 0)
    }
}
