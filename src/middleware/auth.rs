//! API Key 认证
//!
//! 重启确认通道的 `RequireConfirmKey` extractor：
//! 配置了 `DEPLOY_CONFIRM_API_KEY` 时校验 `x-api-key`，未配置时放行

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::HeaderMap, request::Parts},
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

/// 确认通道认证 Extractor
#[derive(Debug, Clone)]
pub struct RequireConfirmKey {
    /// 是否经过了 key 校验
    pub authenticated: bool,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireConfirmKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        match state.config.confirm_api_key.as_deref() {
            Some(expected) => verify_api_key(&parts.headers, expected).map(|_| RequireConfirmKey {
                authenticated: true,
            }),
            None => Ok(RequireConfirmKey {
                authenticated: false,
            }),
        }
    }
}

/// 检查 `x-api-key` header 是否与配置的 key 匹配
pub fn verify_api_key(headers: &HeaderMap, expected_key: &str) -> Result<(), ApiError> {
    let provided_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());

    match provided_key {
        Some(key) if key == expected_key => Ok(()),
        Some(_) => {
            tracing::warn!("Invalid API key provided");
            Err(ApiError::unauthorized())
        }
        None => {
            tracing::warn!("Missing x-api-key header");
            Err(ApiError::unauthorized())
        }
    }
}
