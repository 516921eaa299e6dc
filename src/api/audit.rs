//! Progress toggles, progress queries and alert queries.

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ApiError, ApiResult, ApiState, blocking};
use crate::audit::store::DEFAULT_LIST_LIMIT;
use crate::audit::types::{
    AlertDetailRow, AlertSummaryRow, MAX_PAGE_ROWS, ProgressRow, ProgressSummaryRow,
};
use crate::audit::{GridPage, PageRequest, ProgressStatus, SortOrder};

const SUMMARY_PAGE_ROWS: u32 = 25;
const TIMELINE_PAGE_ROWS: u32 = 20;
const GRID_PAGE_ROWS: u32 = 25;

/// jqGrid-style query string.
#[derive(Debug, Default, Deserialize)]
pub struct GridQuery {
    page: Option<u32>,
    rows: Option<u32>,
    sidx: Option<String>,
    sord: Option<String>,
    rule_name: Option<String>,
    imei: Option<String>,
    #[serde(rename = "searchText")]
    search_text: Option<String>,
}

impl GridQuery {
    fn page(&self, default_rows: u32, default_sort: &str, default_order: SortOrder) -> PageRequest {
        let sort_by = self
            .sidx
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(default_sort);
        PageRequest::new(self.page, self.rows, default_rows)
            .sorted(sort_by, SortOrder::parse_or(self.sord.as_deref(), default_order))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    imei: Option<String>,
    limit: Option<u32>,
}

impl ListQuery {
    fn limit(&self) -> u32 {
        self.limit
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .min(MAX_PAGE_ROWS)
    }

    fn imei(&self) -> Option<String> {
        self.imei
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotQuery {
    id: Option<String>,
}

fn query<T>(extracted: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    extracted
        .map(|Query(q)| q)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

// ──────────────────── toggles ────────────────────

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    success: bool,
    message: String,
    #[serde(flatten)]
    status: ProgressStatus,
    rows: i64,
}

pub async fn enable_progress(State(state): State<ApiState>) -> Json<Value> {
    state.engine.recorder().enable();
    Json(json!({
        "success": true,
        "message": "Progress audit enabled",
        "status": "enabled",
        "enabled": true,
    }))
}

pub async fn disable_progress(State(state): State<ApiState>) -> Json<Value> {
    state.engine.recorder().disable();
    Json(json!({
        "success": true,
        "message": "Progress audit disabled",
        "status": "disabled",
        "enabled": false,
    }))
}

pub async fn clear_progress(State(state): State<ApiState>) -> ApiResult<Value> {
    let recorder = state.engine.recorder().clone();
    let deleted = blocking(move || recorder.clear()).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Progress audit data cleared",
        "status": "cleared",
        "deleted": deleted,
    })))
}

pub async fn progress_status(State(state): State<ApiState>) -> ApiResult<StatusResponse> {
    let status = state.engine.recorder().status();
    let audit = state.audit.clone();
    let rows = blocking(move || audit.progress_count()).await?;
    let message = if status.enabled {
        "Progress audit is enabled"
    } else {
        "Progress audit is disabled"
    };
    Ok(Json(StatusResponse {
        success: true,
        message: message.to_string(),
        status,
        rows,
    }))
}

// ──────────────────── progress queries ────────────────────

pub async fn recent_progress(
    State(state): State<ApiState>,
    params: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Vec<ProgressRow>> {
    let params = query(params)?;
    let (imei, limit) = (params.imei(), params.limit());
    let audit = state.audit.clone();
    let rows = blocking(move || audit.recent_progress(imei.as_deref(), limit)).await?;
    Ok(Json(rows))
}

pub async fn progress_summary(
    State(state): State<ApiState>,
    params: Result<Query<GridQuery>, QueryRejection>,
) -> ApiResult<GridPage<ProgressSummaryRow>> {
    let params = query(params)?;
    let request = params.page(SUMMARY_PAGE_ROWS, "last_frame_time", SortOrder::Desc);
    let audit = state.audit.clone();
    let page = blocking(move || {
        audit.progress_summary(&request, params.rule_name.as_deref(), params.imei.as_deref())
    })
    .await?;
    Ok(Json(page))
}

pub async fn timeline(
    State(state): State<ApiState>,
    params: Result<Query<GridQuery>, QueryRejection>,
) -> ApiResult<GridPage<ProgressRow>> {
    let params = query(params)?;
    let imei = params
        .imei
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| ApiError::bad_request("imei is required"))?;
    let request = params.page(TIMELINE_PAGE_ROWS, "execution_time", SortOrder::Asc);
    let audit = state.audit.clone();
    let page =
        blocking(move || audit.timeline(&imei, &request, params.rule_name.as_deref())).await?;
    Ok(Json(page))
}

pub async fn snapshot(
    State(state): State<ApiState>,
    params: Result<Query<SnapshotQuery>, QueryRejection>,
) -> ApiResult<Value> {
    let params = query(params)?;
    let raw = params
        .id
        .ok_or_else(|| ApiError::bad_request("id is required"))?;
    let id: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid id: {raw}")))?;
    let audit = state.audit.clone();
    match blocking(move || audit.snapshot_by_id(id)).await? {
        Some(snapshot) => Ok(Json(json!({ "id": id, "snapshot": snapshot }))),
        None => Err(ApiError::not_found(format!("snapshot {id} not found"))),
    }
}

// ──────────────────── alert queries ────────────────────

pub async fn alert_grid(
    State(state): State<ApiState>,
    params: Result<Query<GridQuery>, QueryRejection>,
) -> ApiResult<GridPage<AlertSummaryRow>> {
    let params = query(params)?;
    let request = params.page(GRID_PAGE_ROWS, "last_alert_date", SortOrder::Desc);
    let audit = state.audit.clone();
    let page = blocking(move || audit.alert_grid(&request, params.search_text.as_deref())).await?;
    Ok(Json(page))
}

pub async fn alert_summary(
    State(state): State<ApiState>,
    params: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Vec<AlertSummaryRow>> {
    let limit = query(params)?.limit();
    let audit = state.audit.clone();
    Ok(Json(blocking(move || audit.alert_summaries(limit)).await?))
}

pub async fn alert_details(
    State(state): State<ApiState>,
    params: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Vec<AlertDetailRow>> {
    let params = query(params)?;
    let imei = params
        .imei()
        .ok_or_else(|| ApiError::bad_request("imei is required"))?;
    let limit = params.limit();
    let audit = state.audit.clone();
    Ok(Json(blocking(move || audit.alert_details(&imei, limit)).await?))
}
