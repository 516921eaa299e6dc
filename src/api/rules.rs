//! Rule listing, hot reload and health.

use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use super::{ApiResult, ApiState, blocking};
use crate::audit::types::AuditedRule;
use crate::engine::ReloadSummary;

#[derive(Debug, Serialize)]
pub struct RuleView {
    id: i64,
    name: String,
    description: String,
    priority: i64,
    active: bool,
    /// Compiled into the currently published set.
    loaded: bool,
    has_manifest: bool,
}

#[derive(Debug, Serialize)]
pub struct RulesResponse {
    digest: String,
    loaded_at: DateTime<Utc>,
    skipped: Vec<String>,
    rules: Vec<RuleView>,
}

pub async fn list_rules(State(state): State<ApiState>) -> ApiResult<RulesResponse> {
    let engine = state.engine.clone();
    let definitions = blocking(move || engine.list_rules()).await?;
    let set = state.engine.rule_set();
    let rules = definitions
        .into_iter()
        .map(|rule| RuleView {
            loaded: set.rules().iter().any(|r| r.definition.name == rule.name),
            has_manifest: rule.audit_manifest.as_deref().is_some_and(|m| !m.trim().is_empty()),
            id: rule.id,
            name: rule.name,
            description: rule.description,
            priority: rule.priority,
            active: rule.active,
        })
        .collect();
    Ok(Json(RulesResponse {
        digest: set.digest().to_string(),
        loaded_at: set.loaded_at(),
        skipped: set.skipped().to_vec(),
        rules,
    }))
}

pub async fn available_rules(State(state): State<ApiState>) -> ApiResult<Vec<AuditedRule>> {
    let audit = state.audit.clone();
    Ok(Json(blocking(move || audit.available_rules()).await?))
}

pub async fn reload(State(state): State<ApiState>) -> ApiResult<ReloadSummary> {
    let engine = state.engine.clone();
    Ok(Json(blocking(move || engine.reload_rules()).await?))
}

pub async fn health(State(state): State<ApiState>) -> Json<Value> {
    let set = state.engine.rule_set();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.engine.uptime().as_secs(),
        "rules_loaded": set.len(),
        "digest": set.digest(),
        "progress_enabled": state.engine.recorder().is_progress_enabled(),
        "devices": state.engine.registry().buffers().device_count(),
    }))
}
