//! Redis-backed lock service (`SET NX PX` + token-checked delete).

use super::{Lease, LockService};
use crate::clock::Clock;
use crate::error::LockError;
use anyhow::Context as _;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;

/// Release must only delete the key while we still own it, so the
/// compare-and-delete happens server-side in one script.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct RedisLockService {
    conn: ConnectionManager,
    clock: Arc<dyn Clock>,
}

impl RedisLockService {
    pub async fn connect(url: &str, clock: Arc<dyn Clock>) -> crate::error::Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid lock coordinator URL: {url}"))?;
        let conn = client
            .get_connection_manager()
            .await
            .context("failed to connect to lock coordinator")?;

        Ok(Self { conn, clock })
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn acquire(
        &self,
        key: &str,
        lease_ttl: Duration,
        wait_budget: Duration,
    ) -> Result<Lease, LockError> {
        let token = uuid::Uuid::new_v4().to_string();
        let ttl_ms = lease_ttl.as_millis() as u64;
        let give_up = tokio::time::Instant::now() + wait_budget;
        let mut conn = self.conn.clone();

        loop {
            let response: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(|err| LockError::Unavailable(err.to_string()))?;

            if response.is_some() {
                let deadline = self.clock.now() + chrono::Duration::milliseconds(ttl_ms as i64);
                return Ok(Lease {
                    key: key.to_string(),
                    token,
                    deadline,
                });
            }

            if tokio::time::Instant::now() + ACQUIRE_POLL_INTERVAL >= give_up {
                return Err(LockError::Busy);
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    async fn release(&self, lease: Lease) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| LockError::Unavailable(err.to_string()))?;

        if released == 1 {
            Ok(())
        } else {
            Err(LockError::LostLease)
        }
    }
}
