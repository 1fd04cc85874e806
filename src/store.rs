//! Scheduled task and execution history storage (SQLite).

use crate::error::Result;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, SqlitePool, Transaction};
use std::str::FromStr;

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Done,
    Failed,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Done => "done",
            ResultStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "done" => Some(ResultStatus::Done),
            "failed" => Some(ResultStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A recurring job definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub scheduled_task_id: String,
    pub slug: String,
    pub name: String,
    pub cron_expression: String,
    pub created_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
}

/// An immutable execution history record.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedTask {
    pub executed_task_id: String,
    pub task_id: String,
    pub executed_at: DateTime<Utc>,
    pub status: ResultStatus,
    pub result: String,
}

#[derive(Debug, Clone)]
pub struct CreateTaskInput {
    pub name: String,
    pub cron_expression: String,
    pub created_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
}

const SLUG_LEN: usize = 10;

fn generate_slug() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), SLUG_LEN)
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool on the given sqlx SQLite URL with foreign keys enabled
    /// (cascade delete from tasks to history relies on them).
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database URL: {url}"))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to SQLite")?;

        Ok(Self::new(pool))
    }

    /// Create both tables and their indexes if absent.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                scheduled_task_id TEXT PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                cron_expression TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL,
                next_run_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create scheduled_tasks table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executed_tasks (
                executed_task_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL
                    REFERENCES scheduled_tasks(scheduled_task_id) ON DELETE CASCADE,
                executed_at TIMESTAMP NOT NULL,
                status TEXT NOT NULL,
                result TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create executed_tasks table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_executed_tasks_task \
             ON executed_tasks(task_id, executed_at)",
        )
        .execute(&self.pool)
        .await
        .context("failed to create executed_tasks index")?;

        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, sqlx::Sqlite>> {
        let tx = self
            .pool
            .begin()
            .await
            .context("failed to open store transaction")?;
        Ok(tx)
    }

    pub async fn create(&self, input: CreateTaskInput) -> Result<ScheduledTask> {
        let mut tx = self.begin().await?;
        let task = self.create_tx(&mut tx, input).await?;
        tx.commit()
            .await
            .context("failed to commit task create transaction")?;
        Ok(task)
    }

    /// Maximum number of retries when a freshly generated slug collides with
    /// an existing row's UNIQUE constraint.
    const MAX_SLUG_RETRIES: usize = 3;

    pub async fn create_tx(
        &self,
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        input: CreateTaskInput,
    ) -> Result<ScheduledTask> {
        for attempt in 0..Self::MAX_SLUG_RETRIES {
            let task = ScheduledTask {
                scheduled_task_id: uuid::Uuid::new_v4().to_string(),
                slug: generate_slug(),
                name: input.name.clone(),
                cron_expression: input.cron_expression.clone(),
                created_at: input.created_at,
                next_run_at: input.next_run_at,
            };

            let insert_result = sqlx::query(
                r#"
                INSERT INTO scheduled_tasks (
                    scheduled_task_id, slug, name, cron_expression, created_at, next_run_at
                )
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&task.scheduled_task_id)
            .bind(&task.slug)
            .bind(&task.name)
            .bind(&task.cron_expression)
            .bind(task.created_at)
            .bind(task.next_run_at)
            .execute(&mut **tx)
            .await;

            match insert_result {
                Ok(_) => return Ok(task),
                Err(sqlx::Error::Database(ref db_error))
                    if db_error.code().as_deref() == Some("2067") =>
                {
                    tracing::debug!(attempt, slug = %task.slug, "slug collision, retrying");
                    continue;
                }
                Err(error) => {
                    return Err(anyhow::anyhow!("failed to insert task: {error}").into());
                }
            }
        }

        Err(anyhow::anyhow!(
            "failed to create task after {} slug collisions",
            Self::MAX_SLUG_RETRIES
        )
        .into())
    }

    pub async fn get_by_slug(&self, slug: &str) -> Result<Option<ScheduledTask>> {
        let row = sqlx::query(
            "SELECT scheduled_task_id, slug, name, cron_expression, created_at, next_run_at \
             FROM scheduled_tasks WHERE slug = ?",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch task by slug")?;

        row.map(task_from_row).transpose()
    }

    pub async fn get_by_slug_tx(
        &self,
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        slug: &str,
    ) -> Result<Option<ScheduledTask>> {
        let row = sqlx::query(
            "SELECT scheduled_task_id, slug, name, cron_expression, created_at, next_run_at \
             FROM scheduled_tasks WHERE slug = ?",
        )
        .bind(slug)
        .fetch_optional(&mut **tx)
        .await
        .context("failed to fetch task by slug")?;

        row.map(task_from_row).transpose()
    }

    /// Cascading delete. Returns whether a row existed.
    pub async fn delete_by_slug(&self, slug: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE slug = ?")
            .bind(slug)
            .execute(&self.pool)
            .await
            .context("failed to delete task")?;

        Ok(result.rows_affected() > 0)
    }

    /// Page of tasks ordered by creation time, plus the unpaged total.
    pub async fn list(&self, offset: i64, limit: i64) -> Result<(i64, Vec<ScheduledTask>)> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scheduled_tasks")
            .fetch_one(&self.pool)
            .await
            .context("failed to count tasks")?;

        let rows = sqlx::query(
            "SELECT scheduled_task_id, slug, name, cron_expression, created_at, next_run_at \
             FROM scheduled_tasks ORDER BY created_at ASC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("failed to list tasks")?;

        let tasks = rows
            .into_iter()
            .map(task_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((count, tasks))
    }

    /// Every task row, for boot-time recovery.
    pub async fn list_all(&self) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            "SELECT scheduled_task_id, slug, name, cron_expression, created_at, next_run_at \
             FROM scheduled_tasks ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load tasks for recovery")?;

        rows.into_iter().map(task_from_row).collect()
    }

    /// Page of execution history for one task, oldest first.
    pub async fn list_executions(
        &self,
        task_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<(i64, Vec<ExecutedTask>)> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM executed_tasks WHERE task_id = ?")
                .bind(task_id)
                .fetch_one(&self.pool)
                .await
                .context("failed to count executions")?;

        let rows = sqlx::query(
            "SELECT executed_task_id, task_id, executed_at, status, result \
             FROM executed_tasks WHERE task_id = ? ORDER BY executed_at ASC LIMIT ? OFFSET ?",
        )
        .bind(task_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("failed to list executions")?;

        let executions = rows
            .into_iter()
            .map(execution_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((count, executions))
    }

    pub async fn append_execution(
        &self,
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        task_id: &str,
        status: ResultStatus,
        result: &str,
        executed_at: DateTime<Utc>,
    ) -> Result<ExecutedTask> {
        let executed = ExecutedTask {
            executed_task_id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            executed_at,
            status,
            result: result.to_string(),
        };

        sqlx::query(
            "INSERT INTO executed_tasks (executed_task_id, task_id, executed_at, status, result) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&executed.executed_task_id)
        .bind(&executed.task_id)
        .bind(executed.executed_at)
        .bind(executed.status.as_str())
        .bind(&executed.result)
        .execute(&mut **tx)
        .await
        .context("failed to append execution record")?;

        Ok(executed)
    }

    pub async fn update_next_run(
        &self,
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        task_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE scheduled_tasks SET next_run_at = ? WHERE scheduled_task_id = ?")
            .bind(next_run_at)
            .bind(task_id)
            .execute(&mut **tx)
            .await
            .context("failed to update next_run_at")?;

        Ok(())
    }
}

fn task_from_row(row: SqliteRow) -> Result<ScheduledTask> {
    Ok(ScheduledTask {
        scheduled_task_id: row
            .try_get("scheduled_task_id")
            .context("failed to read scheduled_task_id")?,
        slug: row.try_get("slug").context("failed to read slug")?,
        name: row.try_get("name").context("failed to read name")?,
        cron_expression: row
            .try_get("cron_expression")
            .context("failed to read cron_expression")?,
        created_at: row
            .try_get("created_at")
            .context("failed to read created_at")?,
        next_run_at: row
            .try_get("next_run_at")
            .context("failed to read next_run_at")?,
    })
}

fn execution_from_row(row: SqliteRow) -> Result<ExecutedTask> {
    let status_value: String = row
        .try_get("status")
        .context("failed to read execution status")?;
    let status = ResultStatus::parse(&status_value)
        .with_context(|| format!("invalid execution status in database: {status_value}"))?;

    Ok(ExecutedTask {
        executed_task_id: row
            .try_get("executed_task_id")
            .context("failed to read executed_task_id")?,
        task_id: row.try_get("task_id").context("failed to read task_id")?,
        executed_at: row
            .try_get("executed_at")
            .context("failed to read executed_at")?,
        status,
        result: row.try_get("result").context("failed to read result")?,
    })
}

#[cfg(test)]
impl TaskStore {
    /// Single-connection in-memory store with the schema applied.
    pub(crate) async fn connect_in_memory() -> TaskStore {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .expect("in-memory sqlite URL should parse")
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("in-memory sqlite should connect");

        let store = TaskStore::new(pool);
        store.init_schema().await.expect("schema should be created");
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn input(name: &str, created_at: DateTime<Utc>) -> CreateTaskInput {
        CreateTaskInput {
            name: name.to_string(),
            cron_expression: "*/5 * * * *".to_string(),
            created_at,
            next_run_at: created_at + chrono::Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn create_populates_identity_fields() {
        let store = TaskStore::connect_in_memory().await;
        let task = store
            .create(input("nightly", utc(2025, 1, 1, 0, 0, 0)))
            .await
            .expect("task should be created");

        assert_eq!(task.slug.len(), 10);
        assert!(task.slug.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!task.scheduled_task_id.is_empty());
        assert_eq!(task.created_at, utc(2025, 1, 1, 0, 0, 0));
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = TaskStore::connect_in_memory().await;
        let created = store
            .create(input("round-trip", utc(2025, 1, 1, 8, 0, 0)))
            .await
            .expect("task should be created");

        let fetched = store
            .get_by_slug(&created.slug)
            .await
            .expect("lookup should succeed")
            .expect("task should exist");

        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn delete_cascades_to_history() {
        let store = TaskStore::connect_in_memory().await;
        let task = store
            .create(input("doomed", utc(2025, 1, 1, 0, 0, 0)))
            .await
            .expect("task should be created");

        let mut tx = store.begin().await.expect("tx should open");
        for i in 0..2 {
            store
                .append_execution(
                    &mut tx,
                    &task.scheduled_task_id,
                    ResultStatus::Done,
                    &format!("result-{i}"),
                    utc(2025, 1, 1, 0, 5 * (i + 1) as u32, 0),
                )
                .await
                .expect("execution should append");
        }
        tx.commit().await.expect("tx should commit");

        assert!(
            store
                .delete_by_slug(&task.slug)
                .await
                .expect("delete should succeed")
        );

        let (count, rows) = store
            .list_executions(&task.scheduled_task_id, 0, 10)
            .await
            .expect("listing should succeed");
        assert_eq!(count, 0);
        assert!(rows.is_empty());

        // Idempotent on already absent.
        assert!(
            !store
                .delete_by_slug(&task.slug)
                .await
                .expect("second delete should succeed")
        );
    }

    #[tokio::test]
    async fn list_pages_in_creation_order() {
        let store = TaskStore::connect_in_memory().await;
        for (i, name) in ["first", "second", "third"].iter().enumerate() {
            store
                .create(input(name, utc(2025, 1, 1, i as u32, 0, 0)))
                .await
                .expect("task should be created");
        }

        let (count, page) = store.list(1, 1).await.expect("listing should succeed");
        assert_eq!(count, 3);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name, "second");
    }

    #[tokio::test]
    async fn executions_page_ordered_by_time() {
        let store = TaskStore::connect_in_memory().await;
        let task = store
            .create(input("history", utc(2025, 1, 1, 0, 0, 0)))
            .await
            .expect("task should be created");

        let mut tx = store.begin().await.expect("tx should open");
        for i in 0..10 {
            store
                .append_execution(
                    &mut tx,
                    &task.scheduled_task_id,
                    ResultStatus::Done,
                    &format!("result-{i}"),
                    utc(2025, 1, 1, 1, i, 0),
                )
                .await
                .expect("execution should append");
        }
        tx.commit().await.expect("tx should commit");

        let (count, page) = store
            .list_executions(&task.scheduled_task_id, 5, 2)
            .await
            .expect("listing should succeed");
        assert_eq!(count, 10);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].result, "result-5");
        assert_eq!(page[1].result, "result-6");
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back_fire_mutations() {
        let store = TaskStore::connect_in_memory().await;
        let task = store
            .create(input("atomic", utc(2025, 1, 1, 0, 0, 0)))
            .await
            .expect("task should be created");

        {
            let mut tx = store.begin().await.expect("tx should open");
            store
                .append_execution(
                    &mut tx,
                    &task.scheduled_task_id,
                    ResultStatus::Done,
                    "never visible",
                    utc(2025, 1, 1, 0, 5, 0),
                )
                .await
                .expect("execution should append");
            store
                .update_next_run(&mut tx, &task.scheduled_task_id, utc(2025, 1, 1, 0, 10, 0))
                .await
                .expect("cursor update should succeed");
            // Dropped without commit: both mutations roll back together.
        }

        let (count, _) = store
            .list_executions(&task.scheduled_task_id, 0, 10)
            .await
            .expect("listing should succeed");
        assert_eq!(count, 0);

        let fetched = store
            .get_by_slug(&task.slug)
            .await
            .expect("lookup should succeed")
            .expect("task should exist");
        assert_eq!(fetched.next_run_at, task.next_run_at);
    }

    #[test]
    fn status_round_trips_through_as_str() {
        for status in [ResultStatus::Done, ResultStatus::Failed] {
            assert_eq!(ResultStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ResultStatus::parse("pending"), None);
    }
}
