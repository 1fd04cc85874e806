//! HTTP admin API.
//!
//! A thin axum surface over the store and the dispatcher: task CRUD,
//! execution history, and a health probe. Fire-path errors never show up
//! here; everything user-visible is a structured `{detail, error_code}`
//! body.

mod server;
mod state;
mod system;
mod tasks;

pub use server::start_http_server;
pub use state::ApiState;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// A user-visible error with a stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
    error_code: &'static str,
}

impl ApiError {
    pub fn validation(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            detail: detail.into(),
            error_code: "VALIDATION_422",
        }
    }

    pub fn task_not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: "Task not found".into(),
            error_code: "TASK_404",
        }
    }

    pub fn create_failed() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: "Failed to create/schedule task".into(),
            error_code: "TASK_CREATE_500",
        }
    }

    pub fn delete_failed() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: "Failed to delete task".into(),
            error_code: "TASK_DELETE_500",
        }
    }

    pub fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: "Internal server error".into(),
            error_code: "INTERNAL_500",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "detail": self.detail,
            "error_code": self.error_code,
        });
        (self.status, Json(body)).into_response()
    }
}
