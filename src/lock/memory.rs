//! In-process lock service with the same lease semantics as the Redis
//! implementation. Used by tests and by single-replica deployments that have
//! no coordinator to share.

use super::{Lease, LockService};
use crate::clock::Clock;
use crate::error::LockError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(25);

struct HeldLock {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct InMemoryLockService {
    clock: Arc<dyn Clock>,
    held: Mutex<HashMap<String, HeldLock>>,
}

impl InMemoryLockService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            held: Mutex::new(HashMap::new()),
        }
    }

    fn try_acquire(&self, key: &str, token: &str, lease_ttl: Duration) -> Option<Lease> {
        let now = self.clock.now();
        let mut held = self.held.lock().expect("lock table mutex poisoned");

        if let Some(existing) = held.get(key)
            && existing.expires_at > now
        {
            return None;
        }

        let expires_at = now + chrono::Duration::milliseconds(lease_ttl.as_millis() as i64);
        held.insert(
            key.to_string(),
            HeldLock {
                token: token.to_string(),
                expires_at,
            },
        );

        Some(Lease {
            key: key.to_string(),
            token: token.to_string(),
            deadline: expires_at,
        })
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(
        &self,
        key: &str,
        lease_ttl: Duration,
        wait_budget: Duration,
    ) -> Result<Lease, LockError> {
        let token = uuid::Uuid::new_v4().to_string();
        let give_up = tokio::time::Instant::now() + wait_budget;

        loop {
            if let Some(lease) = self.try_acquire(key, &token, lease_ttl) {
                return Ok(lease);
            }
            if tokio::time::Instant::now() + ACQUIRE_POLL_INTERVAL >= give_up {
                return Err(LockError::Busy);
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    async fn release(&self, lease: Lease) -> Result<(), LockError> {
        let now = self.clock.now();
        let mut held = self.held.lock().expect("lock table mutex poisoned");

        match held.get(&lease.key) {
            Some(existing) if existing.token == lease.token && existing.expires_at > now => {
                held.remove(&lease.key);
                Ok(())
            }
            // Expired, stolen, or never held: the lease is gone either way.
            _ => Err(LockError::LostLease),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn service() -> (InMemoryLockService, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        (InMemoryLockService::new(Arc::new(clock.clone())), clock)
    }

    const TTL: Duration = Duration::from_secs(300);
    const BUDGET: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn second_acquire_is_busy_until_release() {
        let (service, _clock) = service();

        let lease = service
            .acquire("lock:task:abc", TTL, BUDGET)
            .await
            .expect("first acquire should succeed");

        let busy = service.acquire("lock:task:abc", TTL, BUDGET).await;
        assert!(matches!(busy, Err(LockError::Busy)));

        service
            .release(lease)
            .await
            .expect("release should succeed");

        service
            .acquire("lock:task:abc", TTL, BUDGET)
            .await
            .expect("reacquire after release should succeed");
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let (service, _clock) = service();

        service
            .acquire("lock:task:abc", TTL, BUDGET)
            .await
            .expect("first key should acquire");
        service
            .acquire("lock:task:xyz", TTL, BUDGET)
            .await
            .expect("second key should acquire");
    }

    #[tokio::test(start_paused = true)]
    async fn double_release_loses_the_lease() {
        let (service, _clock) = service();

        let lease = service
            .acquire("lock:task:abc", TTL, BUDGET)
            .await
            .expect("acquire should succeed");

        service
            .release(lease.clone())
            .await
            .expect("first release should succeed");

        let second = service.release(lease).await;
        assert!(matches!(second, Err(LockError::LostLease)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_can_be_stolen() {
        let (service, clock) = service();

        let stale = service
            .acquire("lock:task:abc", TTL, BUDGET)
            .await
            .expect("acquire should succeed");

        clock.advance(chrono::Duration::seconds(301));

        let fresh = service
            .acquire("lock:task:abc", TTL, BUDGET)
            .await
            .expect("expired lock should be reacquirable");
        assert_ne!(fresh.token, stale.token);

        // The original holder finds out at release time.
        let late = service.release(stale).await;
        assert!(matches!(late, Err(LockError::LostLease)));
    }
}
