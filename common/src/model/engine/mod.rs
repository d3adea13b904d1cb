//! Processing-lock (engine singleton) model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Id of the single engine-lock row. Exactly one row exists system-wide;
/// absence of the row is equivalent to "never run".
pub const ENGINE_LOCK_ID: i32 = 1;

/// State of the singleton processing loop.
///
/// `acquired_at` is set while an engine instance is running (a stale value
/// after a crash must be stolen explicitly with `force`). `trade_at` is the
/// trade clock: the logical timestamp most recently assigned to an
/// in-progress matching batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineLock {
    /// When the running engine acquired the lock, if any
    pub acquired_at: Option<DateTime<Utc>>,
    /// Trade clock of the current/most recent batch
    pub trade_at: Option<DateTime<Utc>>,
}

impl EngineLock {
    pub fn is_held(&self) -> bool {
        self.acquired_at.is_some()
    }
}
