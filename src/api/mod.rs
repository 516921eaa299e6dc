//! HTTP audit API.
//!
//! Every route lives under the configured base path (default `/grule/api`).
//! Errors are JSON `{"error": "..."}`; storage calls run on the blocking pool.

#![allow(missing_docs)]

mod audit;
mod rules;

use std::future::Future;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::http::{StatusCode, Uri, header};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;

use crate::audit::SqliteAuditStore;
use crate::core::errors::{FreError, Result};
use crate::engine::Engine;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
    pub audit: Arc<SqliteAuditStore>,
}

impl ApiState {
    pub fn new(engine: Arc<Engine>, audit: Arc<SqliteAuditStore>) -> Self {
        Self { engine, audit }
    }
}

/// Build the router, nested under `base_path` when it is non-empty.
pub fn router(state: ApiState, base_path: &str) -> Router {
    let routes = Router::new()
        .route("/audit/progress/enable", post(audit::enable_progress))
        .route("/audit/progress/disable", post(audit::disable_progress))
        .route("/audit/progress/clear", post(audit::clear_progress))
        .route("/audit/progress/status", get(audit::progress_status))
        .route("/audit/progress", get(audit::recent_progress))
        .route("/audit/progress/summary", get(audit::progress_summary))
        .route("/audit/progress/timeline", get(audit::timeline))
        .route("/audit/progress/snapshot", get(audit::snapshot))
        .route("/audit/grid", get(audit::alert_grid))
        .route("/audit/summary", get(audit::alert_summary))
        .route("/audit/details", get(audit::alert_details))
        .route("/rules", get(rules::list_rules))
        .route("/rules/available", get(rules::available_rules))
        .route("/reload", post(rules::reload))
        .route("/health", get(rules::health))
        .with_state(state);

    let base = base_path.trim_end_matches('/');
    let app = if base.is_empty() {
        routes
    } else {
        Router::new().nest(base, routes)
    };
    app.fallback(route_not_found)
        .layer(middleware::map_response(json_error_body))
}

async fn route_not_found(uri: Uri) -> ApiError {
    ApiError::not_found(format!("no route for {}", uri.path()))
}

/// Routing answers 404/405 with an empty body; give those the JSON error
/// shape. The `Allow` header of a 405 is kept.
async fn json_error_body(uri: Uri, response: Response) -> Response {
    if response.headers().contains_key(header::CONTENT_TYPE) {
        return response;
    }
    let error = match response.status() {
        StatusCode::METHOD_NOT_ALLOWED => ApiError::method_not_allowed(),
        StatusCode::NOT_FOUND => ApiError::not_found(format!("no route for {}", uri.path())),
        _ => return response,
    };
    let mut json = error.into_response();
    if let Some(allow) = response.headers().get(header::ALLOW) {
        json.headers_mut().insert(header::ALLOW, allow.clone());
    }
    json
}

// ──────────────────── errors ────────────────────

/// JSON error body with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn method_not_allowed() -> Self {
        Self {
            status: StatusCode::METHOD_NOT_ALLOWED,
            message: "Method not allowed".to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<FreError> for ApiError {
    fn from(error: FreError) -> Self {
        match error {
            FreError::NotFound { .. } => Self::not_found(error.to_string()),
            FreError::PayloadParse { .. } | FreError::InvalidConfig { .. } => {
                Self::bad_request(error.to_string())
            }
            other => {
                tracing::error!(code = other.code(), error = %other, "api request failed");
                Self::internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub(crate) type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Run a store call on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> std::result::Result<T, ApiError>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("background task failed: {e}")))?
        .map_err(ApiError::from)
}
