//! Cross-process mutual exclusion.
//!
//! A fire must happen at most once per tick across every replica sharing the
//! store, so the runner takes a keyed lease before touching the database. The
//! lease is time-bounded: a holder that outlives its TTL may race, which is
//! why the runner keeps its critical section to a single short transaction.

mod memory;
mod redis;

pub use memory::InMemoryLockService;
pub use redis::RedisLockService;

use crate::error::LockError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Time-bounded ownership of a lock key.
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: String,
    pub token: String,
    /// Instant at which the coordinator may hand the key to someone else.
    pub deadline: DateTime<Utc>,
}

/// Lock key for a task, shared by every replica.
pub fn task_lock_key(slug: &str) -> String {
    format!("lock:task:{slug}")
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Take the lease on `key`, waiting up to `wait_budget` for the current
    /// holder to let go. `Busy` when the budget runs out, `Unavailable` when
    /// the coordinator cannot be reached.
    async fn acquire(
        &self,
        key: &str,
        lease_ttl: Duration,
        wait_budget: Duration,
    ) -> Result<Lease, LockError>;

    /// Give the lease back. Releases only while the owner token still
    /// matches; `LostLease` means the TTL expired first and the key may
    /// already belong to another holder.
    async fn release(&self, lease: Lease) -> Result<(), LockError>;
}
