//! Boot-time reconciliation between the store and the dispatcher.
//!
//! The dispatcher map is empty after a restart; every persisted task gets
//! re-armed from its row. Tasks whose fire instant passed while the process
//! was down are handled according to the configured policy. A broken task
//! is logged and skipped, never fatal.

use crate::clock::Clock;
use crate::config::PastTaskPolicy;
use crate::cron;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::store::{ResultStatus, ScheduledTask, TaskStore};
use anyhow::Context as _;
use chrono::{DateTime, Utc};

pub const MISSED_EXECUTION_RESULT: &str = "Missed execution: system was down";

/// Rebuild the dispatcher from the store. Called before the admin API
/// starts accepting traffic.
pub async fn recover(
    store: &TaskStore,
    dispatcher: &Dispatcher,
    clock: &dyn Clock,
    policy: PastTaskPolicy,
) -> Result<()> {
    let now = clock.now();
    let tasks = store.list_all().await?;
    let (overdue, upcoming): (Vec<_>, Vec<_>) =
        tasks.into_iter().partition(|task| task.next_run_at <= now);

    tracing::info!(
        upcoming = upcoming.len(),
        overdue = overdue.len(),
        policy = %policy,
        "recovering scheduled tasks"
    );

    match policy {
        PastTaskPolicy::Skip => {
            // Re-arming recomputes the next instant strictly after now; the
            // missed tick is silently dropped.
            arm_each(dispatcher, &overdue).await;
        }
        PastTaskPolicy::Fail => {
            if let Err(error) = fail_overdue(store, dispatcher, &overdue, now).await {
                tracing::error!(%error, "failed to record missed executions");
            }
        }
        PastTaskPolicy::Run => {
            for task in &overdue {
                dispatcher.arm_at(task, now).await;
                tracing::info!(slug = %task.slug, "overdue task scheduled to run immediately");
            }
        }
    }

    arm_each(dispatcher, &upcoming).await;
    Ok(())
}

async fn arm_each(dispatcher: &Dispatcher, tasks: &[ScheduledTask]) {
    for task in tasks {
        match dispatcher.arm(task).await {
            Ok(next_run_at) => {
                tracing::info!(slug = %task.slug, name = %task.name, %next_run_at, "task recovered");
            }
            Err(error) => {
                tracing::error!(slug = %task.slug, %error, "failed to recover task");
            }
        }
    }
}

/// Record a failed execution for every missed task and advance its cursor
/// past now, all in one transaction, then arm the survivors.
async fn fail_overdue(
    store: &TaskStore,
    dispatcher: &Dispatcher,
    overdue: &[ScheduledTask],
    now: DateTime<Utc>,
) -> Result<()> {
    if overdue.is_empty() {
        return Ok(());
    }

    let mut rearm: Vec<(&ScheduledTask, DateTime<Utc>)> = Vec::new();
    let mut tx = store.begin().await?;

    for task in overdue {
        let next_run_at = match cron::next_after(&task.cron_expression, now) {
            Ok(next_run_at) => next_run_at,
            Err(error) => {
                tracing::error!(slug = %task.slug, %error, "cannot advance overdue task");
                continue;
            }
        };

        store
            .append_execution(
                &mut tx,
                &task.scheduled_task_id,
                ResultStatus::Failed,
                MISSED_EXECUTION_RESULT,
                now,
            )
            .await?;
        store
            .update_next_run(&mut tx, &task.scheduled_task_id, next_run_at)
            .await?;
        rearm.push((task, next_run_at));
    }

    tx.commit()
        .await
        .context("failed to commit missed execution transaction")?;

    for (task, next_run_at) in rearm {
        dispatcher.arm_at(task, next_run_at).await;
    }

    Ok(())
}
