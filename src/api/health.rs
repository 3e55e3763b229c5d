//! 健康检查 API
//!
//! GET /health

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::domain::deploy::PipelineState;
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    uptime_secs: i64,
    modules: usize,
    state: PipelineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_run: Option<String>,
    pending_trigger: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_revision: Option<String>,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health_check))
}

/// 健康检查，无需认证
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (run_state, active_run) = match state.dispatcher.current().await {
        Some(run) => (run.phase().await, Some(run.run_id.clone())),
        None => (PipelineState::Idle, None),
    };

    let last_revision = state
        .history
        .recent(crate::config::env::constants::MAX_RUN_HISTORY)
        .await
        .into_iter()
        .find(|r| r.is_success())
        .and_then(|r| r.revision);

    let now = chrono::Utc::now();
    Json(HealthResponse {
        status: "ok",
        service: "hook-deployer",
        version: VERSION,
        timestamp: now.to_rfc3339(),
        uptime_secs: (now - state.started_at).num_seconds(),
        modules: state.registry.len(),
        state: run_state,
        active_run,
        pending_trigger: state.dispatcher.has_pending().await,
        last_revision,
    })
}
