//! 重启确认通道
//!
//! POST /message：重启后的服务上报 `{messageType, entityName}`

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::middleware::RequireConfirmKey;
use crate::state::AppState;

/// 确认消息
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationMessage {
    #[serde(default)]
    pub message_type: Option<String>,
    pub entity_name: String,
}

impl ConfirmationMessage {
    /// 缺省类型视为重启确认
    fn is_restart(&self) -> bool {
        self.message_type
            .as_deref()
            .map_or(true, |t| t.eq_ignore_ascii_case("restart"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmationResponse {
    pub accepted: bool,
    pub message: String,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/message", post(receive_message))
}

/// 迟到或意外的确认不是错误，总是返回 200
async fn receive_message(
    auth: RequireConfirmKey,
    State(state): State<Arc<AppState>>,
    Json(message): Json<ConfirmationMessage>,
) -> Json<ConfirmationResponse> {
    info!(
        entity = %message.entity_name,
        message_type = ?message.message_type,
        authenticated = auth.authenticated,
        "Got message request"
    );

    let accepted = message.is_restart() && state.dispatcher.confirm(&message.entity_name).await;

    Json(ConfirmationResponse {
        accepted,
        message: format!("Got message request from {}", message.entity_name),
    })
}
