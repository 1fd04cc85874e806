//! In-memory trigger management.
//!
//! The dispatcher owns a map of `slug -> armed trigger`. Each armed trigger
//! is a one-shot tokio task that sleeps until the task's next cron instant
//! and then hands the slug to the runner. Recurrence comes from the runner
//! re-arming after each fire, not from a looping timer, so a replaced or
//! deleted task can always be cancelled by aborting a single handle.

use crate::clock::Clock;
use crate::cron;
use crate::error::Result;
use crate::runner::Runner;
use crate::store::ScheduledTask;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

struct ArmedTrigger {
    next_run_at: DateTime<Utc>,
    /// Distinguishes this trigger from later re-arms of the same slug. A
    /// woken timer only fires if its generation still owns the map entry.
    generation: u64,
    handle: AbortHandle,
}

struct DispatcherInner {
    triggers: Mutex<HashMap<String, ArmedTrigger>>,
    runner: OnceLock<Runner>,
    clock: Arc<dyn Clock>,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                triggers: Mutex::new(HashMap::new()),
                runner: OnceLock::new(),
                clock,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Wire the runner in after construction. The runner itself holds a
    /// dispatcher handle for re-arming, so the two are connected by the
    /// composition root rather than at construction time.
    pub fn set_runner(&self, runner: Runner) {
        if self.inner.runner.set(runner).is_err() {
            tracing::warn!("dispatcher runner was already wired");
        }
    }

    /// Arm `task` at its next cron instant after now, replacing any existing
    /// trigger under the same slug. Returns the computed instant; the caller
    /// persists it.
    pub async fn arm(&self, task: &ScheduledTask) -> Result<DateTime<Utc>> {
        let next_run_at = cron::next_after(&task.cron_expression, self.inner.clock.now())?;
        self.arm_at(task, next_run_at).await;
        Ok(next_run_at)
    }

    /// Arm `task` for a known instant (re-arm after a fire, or an immediate
    /// one-shot during recovery).
    pub fn arm_at<'a>(
        &'a self,
        task: &'a ScheduledTask,
        next_run_at: DateTime<Utc>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let slug = task.slug.clone();

        // The map lock is held until the new trigger is inserted; the timer
        // task takes the same lock after its sleep, so a zero-delay trigger
        // cannot observe the map before its own entry exists.
        let mut triggers = self.inner.triggers.lock().await;

        let timer_slug = slug.clone();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let delay = (next_run_at - inner.clock.now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(delay).await;

            {
                let mut triggers = inner.triggers.lock().await;
                match triggers.get(&timer_slug) {
                    Some(trigger) if trigger.generation == generation => {
                        triggers.remove(&timer_slug);
                    }
                    // Replaced or disarmed while we slept.
                    _ => return,
                }
            }

            let Some(runner) = inner.runner.get() else {
                tracing::warn!(slug = %timer_slug, "trigger fired before a runner was wired");
                return;
            };
            runner.fire(&timer_slug).await;
        })
        .abort_handle();

        if let Some(old) = triggers.insert(
            slug.clone(),
            ArmedTrigger {
                next_run_at,
                generation,
                handle,
            },
        ) {
            old.handle.abort();
            tracing::debug!(slug = %slug, "replaced existing trigger");
        }

        tracing::info!(slug = %slug, %next_run_at, "task armed");
        })
    }

    /// Cancel the trigger for `slug`, if any. Idempotent.
    pub async fn disarm(&self, slug: &str) {
        let removed = self.inner.triggers.lock().await.remove(slug);
        if let Some(trigger) = removed {
            trigger.handle.abort();
            tracing::info!(slug, "task disarmed");
        }
    }

    /// Currently armed slugs, for diagnostics and tests.
    pub async fn state(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.inner.triggers.lock().await.keys().cloned().collect();
        slugs.sort();
        slugs
    }

    /// Abort every armed trigger.
    pub async fn shutdown(&self) {
        let mut triggers = self.inner.triggers.lock().await;
        for (slug, trigger) in triggers.drain() {
            trigger.handle.abort();
            tracing::debug!(slug = %slug, "trigger stopped");
        }
    }
}
