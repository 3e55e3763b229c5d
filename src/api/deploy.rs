//! 部署 API
//!
//! POST /deployment 接收 GitHub push webhook，GET /runs/* 查询运行

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::env::constants::MAX_RUN_HISTORY;
use crate::domain::report::RunReport;
use crate::domain::trigger::PushPayload;
use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, RunSnapshot};

/// webhook 响应
#[derive(Debug, Serialize, Deserialize)]
pub struct DeploymentResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DeploymentResponse {
    fn ignored(reason: impl Into<String>) -> Self {
        Self {
            status: "ignored".to_string(),
            run_id: None,
            reason: Some(reason.into()),
        }
    }
}

/// 当前运行
#[derive(Debug, Serialize)]
struct CurrentRunResponse {
    run: Option<RunSnapshot>,
    pending_trigger: bool,
}

/// 历史查询参数
#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

/// 创建部署路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deployment", post(receive_push))
        .route("/runs/current", get(current_run))
        .route("/runs/recent", get(recent_runs))
        .route("/runs/:run_id", get(get_run))
}

/// 接收 push webhook
///
/// POST /deployment
/// 非 push 事件、非生产分支、未授权推送者均返回 200 + ignored；
/// 无法解析的负载返回 400
async fn receive_push(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<PushPayload>, JsonRejection>,
) -> ApiResult<Json<DeploymentResponse>> {
    if let Some(event) = headers.get("x-github-event").and_then(|v| v.to_str().ok()) {
        if event != "push" {
            info!(event = %event, "Ignoring non-push webhook");
            return Ok(Json(DeploymentResponse::ignored(format!("{} event", event))));
        }
    }

    let Json(payload) = payload.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "Malformed push payload");
        ApiError::bad_request(rejection.body_text())
    })?;

    let trigger = match state.config.repo.authorize(&payload) {
        Ok(trigger) => trigger,
        Err(rejection) => {
            info!(
                git_ref = %payload.git_ref,
                pusher = %payload.pusher_name(),
                reason = %rejection.message(),
                "Push rejected"
            );
            return Ok(Json(DeploymentResponse::ignored(rejection.message())));
        }
    };

    info!(
        git_ref = %trigger.git_ref,
        pusher = %trigger.pusher_name,
        paths = trigger.changed_paths.len(),
        "Authorized push received"
    );

    let outcome = state.dispatcher.submit(trigger).await;
    Ok(Json(DeploymentResponse {
        status: outcome.as_str().to_string(),
        run_id: outcome.run_id().map(String::from),
        reason: None,
    }))
}

/// GET /runs/current
async fn current_run(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let run = match state.dispatcher.current().await {
        Some(run) => Some(run.snapshot().await),
        None => None,
    };
    Json(CurrentRunResponse {
        run,
        pending_trigger: state.dispatcher.has_pending().await,
    })
}

/// GET /runs/recent?limit=
async fn recent_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Json<Vec<RunReport>> {
    let limit = query.limit.clamp(1, MAX_RUN_HISTORY);
    Json(state.history.recent(limit).await)
}

/// GET /runs/:run_id
async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunReport>> {
    state
        .history
        .get(&run_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Run {}", run_id)))
}
