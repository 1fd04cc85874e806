//! Per-fire execution.
//!
//! One fire is one short critical section: take the task's cross-replica
//! lease, run the work and record the outcome inside a single store
//! transaction, release the lease, re-arm. Failures are recorded as history
//! rows and still advance the cron cursor, so a chronically failing task
//! never stalls.

use crate::clock::Clock;
use crate::cron;
use crate::dispatcher::Dispatcher;
use crate::error::{LockError, Result};
use crate::lock::{self, LockService};
use crate::store::{ResultStatus, ScheduledTask, TaskStore};
use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use std::time::Duration;

/// How long a fire may own its task before another replica can steal it.
/// Orders of magnitude above the expected sub-second fire duration.
pub const LEASE_TTL: Duration = Duration::from_secs(300);

/// How long a fire waits for a peer to release the task before giving up
/// on this tick.
pub const WAIT_BUDGET: Duration = Duration::from_secs(5);

/// The unit of work a fire performs. Deployments plug their own executor in
/// through this seam; the returned string becomes the history row's result.
#[async_trait]
pub trait Workload: Send + Sync {
    async fn execute(
        &self,
        task: &ScheduledTask,
        fired_at: DateTime<Utc>,
    ) -> anyhow::Result<String>;
}

/// Built-in workload: report when the task ran.
pub struct ExecutedAtWorkload;

#[async_trait]
impl Workload for ExecutedAtWorkload {
    async fn execute(
        &self,
        task: &ScheduledTask,
        fired_at: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        Ok(format!(
            "Task '{}' executed at {}",
            task.name,
            fired_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ))
    }
}

struct RunnerInner {
    store: TaskStore,
    lock: Arc<dyn LockService>,
    clock: Arc<dyn Clock>,
    dispatcher: Dispatcher,
    workload: Arc<dyn Workload>,
}

#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    pub fn new(
        store: TaskStore,
        lock: Arc<dyn LockService>,
        clock: Arc<dyn Clock>,
        dispatcher: Dispatcher,
        workload: Arc<dyn Workload>,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                store,
                lock,
                clock,
                dispatcher,
                workload,
            }),
        }
    }

    /// Execute one tick for `slug`.
    ///
    /// Fire-path errors are observable only through history rows and logs;
    /// nothing propagates to the caller.
    pub async fn fire(&self, slug: &str) {
        let key = lock::task_lock_key(slug);
        let lease = match self.inner.lock.acquire(&key, LEASE_TTL, WAIT_BUDGET).await {
            Ok(lease) => lease,
            Err(LockError::Busy) => {
                tracing::info!(slug, "task is locked by another replica, skipping tick");
                return;
            }
            Err(error) => {
                tracing::error!(slug, %error, "lock coordinator unreachable, skipping tick");
                return;
            }
        };

        let rearm = match self.run_fire(slug).await {
            Ok(rearm) => rearm,
            Err(error) => {
                tracing::error!(slug, %error, "task execution failed");
                self.record_failure(slug, &error.to_string()).await
            }
        };

        match self.inner.lock.release(lease).await {
            Ok(()) => {}
            Err(LockError::LostLease) => {
                tracing::warn!(slug, "lease expired before release");
            }
            Err(error) => {
                tracing::warn!(slug, %error, "failed to release task lock");
            }
        }

        // Re-arming happens after release so a slow coordinator never delays
        // the next trigger registration for this task.
        if let Some((task, next_run_at)) = rearm {
            Box::pin(self.inner.dispatcher.arm_at(&task, next_run_at)).await;
        }
    }

    async fn run_fire(&self, slug: &str) -> Result<Option<(ScheduledTask, DateTime<Utc>)>> {
        let now = self.inner.clock.now();
        let mut tx = self.inner.store.begin().await?;

        let Some(task) = self.inner.store.get_by_slug_tx(&mut tx, slug).await? else {
            // Raced with a delete.
            tracing::info!(slug, "task not found or already removed");
            tx.commit()
                .await
                .context("failed to commit empty fire transaction")?;
            return Ok(None);
        };

        tracing::info!(slug, name = %task.name, "executing task");

        let next_run_at = cron::next_after(&task.cron_expression, now)?;
        let result = self.inner.workload.execute(&task, now).await?;

        self.inner
            .store
            .append_execution(&mut tx, &task.scheduled_task_id, ResultStatus::Done, &result, now)
            .await?;
        self.inner
            .store
            .update_next_run(&mut tx, &task.scheduled_task_id, next_run_at)
            .await?;
        tx.commit().await.context("failed to commit fire transaction")?;

        tracing::info!(slug, %next_run_at, "task completed");
        Ok(Some((task, next_run_at)))
    }

    /// Record the failed tick in a fresh transaction and still advance the
    /// cursor. Returns the re-arm target when the task still exists.
    async fn record_failure(
        &self,
        slug: &str,
        message: &str,
    ) -> Option<(ScheduledTask, DateTime<Utc>)> {
        match self.run_failure_tx(slug, message).await {
            Ok(rearm) => rearm,
            Err(error) => {
                // Nothing left to try; the lease expires on its own.
                tracing::error!(slug, %error, "failed to record task failure");
                None
            }
        }
    }

    async fn run_failure_tx(
        &self,
        slug: &str,
        message: &str,
    ) -> Result<Option<(ScheduledTask, DateTime<Utc>)>> {
        let now = self.inner.clock.now();
        let mut tx = self.inner.store.begin().await?;

        let Some(task) = self.inner.store.get_by_slug_tx(&mut tx, slug).await? else {
            tx.commit()
                .await
                .context("failed to commit empty failure transaction")?;
            return Ok(None);
        };

        let next_run_at = cron::next_after(&task.cron_expression, now)?;
        self.inner
            .store
            .append_execution(
                &mut tx,
                &task.scheduled_task_id,
                ResultStatus::Failed,
                &format!("Error: {message}"),
                now,
            )
            .await?;
        self.inner
            .store
            .update_next_run(&mut tx, &task.scheduled_task_id, next_run_at)
            .await?;
        tx.commit()
            .await
            .context("failed to commit failure transaction")?;

        Ok(Some((task, next_run_at)))
    }
}
