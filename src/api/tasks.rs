//! Task CRUD and execution history handlers.

use super::ApiError;
use super::state::ApiState;
use crate::cron;
use crate::store::{CreateTaskInput, ResultStatus, ScheduledTask};

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Deserialize, Debug)]
pub(super) struct CreateTaskRequest {
    name: String,
    cron_expression: String,
}

#[derive(Deserialize)]
pub(super) struct PageQuery {
    #[serde(default)]
    offset: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    10
}

fn validate_page(query: &PageQuery) -> Result<(), ApiError> {
    if query.offset < 0 {
        return Err(ApiError::validation("offset must be >= 0"));
    }
    if !(1..=100).contains(&query.limit) {
        return Err(ApiError::validation("limit must be between 1 and 100"));
    }
    Ok(())
}

#[derive(Serialize)]
pub(super) struct TaskRead {
    slug: String,
    name: String,
    cron_expression: String,
    created_at: DateTime<Utc>,
    next_run_at: DateTime<Utc>,
}

impl From<ScheduledTask> for TaskRead {
    fn from(task: ScheduledTask) -> Self {
        Self {
            slug: task.slug,
            name: task.name,
            cron_expression: task.cron_expression,
            created_at: task.created_at,
            next_run_at: task.next_run_at,
        }
    }
}

#[derive(Serialize)]
pub(super) struct TaskListResponse {
    count: i64,
    result: Vec<TaskRead>,
}

#[derive(Serialize)]
pub(super) struct ExecutionRead {
    task_slug: String,
    executed_at: DateTime<Utc>,
    status: ResultStatus,
    result: String,
}

#[derive(Serialize)]
pub(super) struct ExecutionListResponse {
    count: i64,
    result: Vec<ExecutionRead>,
}

#[derive(Serialize)]
pub(super) struct DeleteResponse {
    message: String,
}

/// Create a task: persist first, arm the dispatcher, commit. A failure to
/// arm rolls the insert back so no unarmed row survives.
pub(super) async fn create_task(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<TaskRead>, ApiError> {
    if let Err(error) = cron::validate(&request.cron_expression) {
        tracing::warn!(name = %request.name, %error, "rejected task with invalid cron expression");
        return Err(ApiError::validation(error.to_string()));
    }

    let now = state.clock.now();
    let next_run_at = cron::next_after(&request.cron_expression, now)
        .map_err(|error| ApiError::validation(error.to_string()))?;

    let mut tx = state.store.begin().await.map_err(|error| {
        tracing::error!(%error, "failed to open create transaction");
        ApiError::create_failed()
    })?;

    let task = state
        .store
        .create_tx(
            &mut tx,
            CreateTaskInput {
                name: request.name,
                cron_expression: request.cron_expression,
                created_at: now,
                next_run_at,
            },
        )
        .await
        .map_err(|error| {
            tracing::error!(%error, "failed to create task");
            ApiError::create_failed()
        })?;

    // The dispatcher recomputes from its own clock; what it armed is what
    // gets persisted.
    let armed_next = match state.dispatcher.arm(&task).await {
        Ok(next) => next,
        Err(error) => {
            tracing::error!(slug = %task.slug, %error, "failed to arm task, rolling back create");
            return Err(ApiError::create_failed());
        }
    };

    if armed_next != task.next_run_at
        && let Err(error) = state
            .store
            .update_next_run(&mut tx, &task.scheduled_task_id, armed_next)
            .await
    {
        state.dispatcher.disarm(&task.slug).await;
        tracing::error!(slug = %task.slug, %error, "failed to persist armed fire instant");
        return Err(ApiError::create_failed());
    }

    if let Err(error) = tx.commit().await {
        state.dispatcher.disarm(&task.slug).await;
        tracing::error!(slug = %task.slug, %error, "failed to commit task create");
        return Err(ApiError::create_failed());
    }

    tracing::info!(slug = %task.slug, name = %task.name, %armed_next, "task created and scheduled");

    Ok(Json(TaskRead {
        next_run_at: armed_next,
        ..task.into()
    }))
}

/// List tasks in creation order with the unpaged total.
pub(super) async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<TaskListResponse>, ApiError> {
    validate_page(&query)?;

    let (count, page) = state
        .store
        .list(query.offset, query.limit)
        .await
        .map_err(|error| {
            tracing::error!(%error, "failed to list tasks");
            ApiError::internal()
        })?;

    Ok(Json(TaskListResponse {
        count,
        result: page.into_iter().map(TaskRead::from).collect(),
    }))
}

/// Delete a task: disarm first, then remove the row (history cascades).
pub(super) async fn delete_task(
    State(state): State<Arc<ApiState>>,
    Path(slug): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    state.dispatcher.disarm(&slug).await;

    match state.store.delete_by_slug(&slug).await {
        Ok(true) => {
            tracing::info!(slug, "task deleted");
            Ok(Json(DeleteResponse {
                message: format!("Task {slug} deleted."),
            }))
        }
        Ok(false) => Err(ApiError::task_not_found()),
        Err(error) => {
            // The trigger is already gone; the surviving row is an
            // alert-worthy inconsistency.
            tracing::error!(slug, %error, "failed to delete task after disarm");
            Err(ApiError::delete_failed())
        }
    }
}

/// Execution history for one task, oldest first.
pub(super) async fn list_task_results(
    State(state): State<Arc<ApiState>>,
    Path(slug): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ExecutionListResponse>, ApiError> {
    validate_page(&query)?;

    let task = state
        .store
        .get_by_slug(&slug)
        .await
        .map_err(|error| {
            tracing::error!(slug, %error, "failed to look up task");
            ApiError::internal()
        })?
        .ok_or_else(ApiError::task_not_found)?;

    let (count, page) = state
        .store
        .list_executions(&task.scheduled_task_id, query.offset, query.limit)
        .await
        .map_err(|error| {
            tracing::error!(slug, %error, "failed to list executions");
            ApiError::internal()
        })?;

    Ok(Json(ExecutionListResponse {
        count,
        result: page
            .into_iter()
            .map(|execution| ExecutionRead {
                task_slug: slug.clone(),
                executed_at: execution.executed_at,
                status: execution.status,
                result: execution.result,
            })
            .collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::start_http_server;
    use crate::clock::{Clock, ManualClock};
    use crate::dispatcher::Dispatcher;
    use crate::lock::{InMemoryLockService, LockService};
    use crate::runner::{ExecutedAtWorkload, Runner};
    use crate::store::TaskStore;
    use chrono::TimeZone;
    use std::net::SocketAddr;

    struct TestServer {
        addr: SocketAddr,
        state: Arc<ApiState>,
        client: reqwest::Client,
        // Dropping the sender would trip the graceful shutdown.
        _shutdown_tx: tokio::sync::watch::Sender<bool>,
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }
    }

    async fn spawn_server(now: DateTime<Utc>) -> TestServer {
        let store = TaskStore::connect_in_memory().await;
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now));
        let lock: Arc<dyn LockService> = Arc::new(InMemoryLockService::new(clock.clone()));
        let dispatcher = Dispatcher::new(clock.clone());
        let runner = Runner::new(
            store.clone(),
            lock,
            clock.clone(),
            dispatcher.clone(),
            Arc::new(ExecutedAtWorkload),
        );
        dispatcher.set_runner(runner);

        let state = Arc::new(ApiState {
            store,
            dispatcher,
            clock,
        });

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let (addr, _handle) = start_http_server(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            state.clone(),
            shutdown_rx,
        )
        .await
        .expect("test server should start");

        TestServer {
            addr,
            state,
            client: reqwest::Client::new(),
            _shutdown_tx: shutdown_tx,
        }
    }

    fn may_2025() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 3, 12, 13, 13).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let server = spawn_server(may_2025()).await;

        let response = server
            .client
            .get(server.url("/health"))
            .send()
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.expect("body should be JSON");
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn create_task_returns_the_schedule() {
        let server = spawn_server(may_2025()).await;

        let response = server
            .client
            .post(server.url("/tasks"))
            .json(&serde_json::json!({
                "name": "Test Task",
                "cron_expression": "13 13 13 5 *",
            }))
            .send()
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.expect("body should be JSON");
        assert_eq!(body["name"], "Test Task");
        assert_eq!(body["cron_expression"], "13 13 13 5 *");
        assert_eq!(body["next_run_at"], "2025-05-13T13:13:00Z");

        let slug = body["slug"].as_str().expect("slug should be present");
        assert_eq!(slug.len(), 10);

        // Persisted and armed.
        let stored = server
            .state
            .store
            .get_by_slug(slug)
            .await
            .expect("lookup should succeed")
            .expect("task should be persisted");
        assert_eq!(
            stored.next_run_at,
            Utc.with_ymd_and_hms(2025, 5, 13, 13, 13, 0).unwrap()
        );
        assert_eq!(server.state.dispatcher.state().await, vec![slug.to_string()]);
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected_without_side_effects() {
        let server = spawn_server(may_2025()).await;

        let response = server
            .client
            .post(server.url("/tasks"))
            .json(&serde_json::json!({
                "name": "Bad Task",
                "cron_expression": "every five minutes",
            }))
            .send()
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), 422);
        let body: serde_json::Value = response.json().await.expect("body should be JSON");
        assert_eq!(body["error_code"], "VALIDATION_422");

        let (count, _) = server
            .state
            .store
            .list(0, 10)
            .await
            .expect("listing should succeed");
        assert_eq!(count, 0);
        assert!(server.state.dispatcher.state().await.is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent_with_a_404_on_the_second_call() {
        let server = spawn_server(may_2025()).await;

        let created: serde_json::Value = server
            .client
            .post(server.url("/tasks"))
            .json(&serde_json::json!({
                "name": "Short Lived",
                "cron_expression": "*/5 * * * *",
            }))
            .send()
            .await
            .expect("create should succeed")
            .json()
            .await
            .expect("body should be JSON");
        let slug = created["slug"].as_str().expect("slug should be present");

        let first = server
            .client
            .delete(server.url(&format!("/tasks/{slug}")))
            .send()
            .await
            .expect("delete should succeed");
        assert_eq!(first.status(), 200);
        let body: serde_json::Value = first.json().await.expect("body should be JSON");
        assert_eq!(body["message"], format!("Task {slug} deleted."));
        assert!(server.state.dispatcher.state().await.is_empty());

        let second = server
            .client
            .delete(server.url(&format!("/tasks/{slug}")))
            .send()
            .await
            .expect("delete should succeed");
        assert_eq!(second.status(), 404);
        let body: serde_json::Value = second.json().await.expect("body should be JSON");
        assert_eq!(body["error_code"], "TASK_404");
    }

    #[tokio::test]
    async fn results_are_paged_in_execution_order() {
        let server = spawn_server(may_2025()).await;

        let created: serde_json::Value = server
            .client
            .post(server.url("/tasks"))
            .json(&serde_json::json!({
                "name": "History Task",
                "cron_expression": "*/5 * * * *",
            }))
            .send()
            .await
            .expect("create should succeed")
            .json()
            .await
            .expect("body should be JSON");
        let slug = created["slug"].as_str().expect("slug should be present");

        let task = server
            .state
            .store
            .get_by_slug(slug)
            .await
            .expect("lookup should succeed")
            .expect("task should exist");

        let mut tx = server.state.store.begin().await.expect("tx should open");
        for i in 0..10 {
            server
                .state
                .store
                .append_execution(
                    &mut tx,
                    &task.scheduled_task_id,
                    ResultStatus::Done,
                    &format!("result-{i}"),
                    may_2025() + chrono::Duration::minutes(i),
                )
                .await
                .expect("execution should append");
        }
        tx.commit().await.expect("tx should commit");

        let response = server
            .client
            .get(server.url(&format!("/tasks/{slug}/results?offset=5&limit=2")))
            .send()
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), 200);

        let body: serde_json::Value = response.json().await.expect("body should be JSON");
        assert_eq!(body["count"], 10);
        let result = body["result"].as_array().expect("result should be a list");
        assert_eq!(result.len(), 2);
        assert_eq!(result[0]["result"], "result-5");
        assert_eq!(result[1]["result"], "result-6");
        assert_eq!(result[0]["status"], "done");
        assert_eq!(result[0]["task_slug"], *slug);
    }

    #[tokio::test]
    async fn results_for_unknown_slug_are_404() {
        let server = spawn_server(may_2025()).await;

        let response = server
            .client
            .get(server.url("/tasks/nonexistent/results"))
            .send()
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), 404);
        let body: serde_json::Value = response.json().await.expect("body should be JSON");
        assert_eq!(body["error_code"], "TASK_404");
    }

    #[tokio::test]
    async fn list_rejects_out_of_range_pagination() {
        let server = spawn_server(may_2025()).await;

        for query in ["?limit=0", "?limit=101", "?offset=-1"] {
            let response = server
                .client
                .get(server.url(&format!("/tasks{query}")))
                .send()
                .await
                .expect("request should succeed");
            assert_eq!(response.status(), 422, "query {query} should be rejected");
        }
    }

    #[tokio::test]
    async fn list_pages_tasks_with_total_count() {
        let server = spawn_server(may_2025()).await;

        for name in ["first", "second", "third"] {
            let response = server
                .client
                .post(server.url("/tasks"))
                .json(&serde_json::json!({
                    "name": name,
                    "cron_expression": "*/5 * * * *",
                }))
                .send()
                .await
                .expect("create should succeed");
            assert_eq!(response.status(), 200);
        }

        let response = server
            .client
            .get(server.url("/tasks?offset=0&limit=2"))
            .send()
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), 200);

        let body: serde_json::Value = response.json().await.expect("body should be JSON");
        assert_eq!(body["count"], 3);
        assert_eq!(body["result"].as_array().map(Vec::len), Some(2));
    }
}
