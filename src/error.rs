//! 统一错误处理
//!
//! - `DeployError`: 部署流水线的错误分类（解析错误、命令失败、重试耗尽等）
//! - `ApiError`: HTTP 层错误，实现 `IntoResponse`

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::domain::graph::Action;

/// 部署错误
///
/// 解析期错误（`UnknownModule`、`DependencyCycle`）表示配置错误，从不重试；
/// 命令级错误在阶段内按重试预算重试，耗尽后升级为 `RetryBudgetExhausted`。
#[derive(Debug, Error)]
pub enum DeployError {
    /// 引用了注册表中不存在的模块
    #[error("unknown module '{name}' (referenced by {referenced_by})")]
    UnknownModule { name: String, referenced_by: String },

    /// 依赖图存在环
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    /// 单条命令执行失败或超时
    #[error("command failed for {module}@{location}: {reason}")]
    CommandExecution {
        module: String,
        location: String,
        reason: String,
    },

    /// 阶段在最大尝试次数后仍有失败命令
    #[error("{action} stage still has {failures} failed command(s) after {attempts} attempt(s)")]
    RetryBudgetExhausted {
        action: Action,
        failures: usize,
        attempts: u32,
    },

    /// 源码更新失败
    #[error("source update failed: {0}")]
    SourceUpdate(String),

    /// 运行被取消（运行级超时或关闭）
    #[error("deployment run cancelled")]
    Cancelled,

    /// 水位线读写失败
    #[error("watermark store error: {0}")]
    Watermark(String),
}

impl DeployError {
    /// 是否为解析期（配置）错误
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            DeployError::UnknownModule { .. } | DeployError::DependencyCycle { .. }
        )
    }

    /// 错误类别标识，用于报告
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::UnknownModule { .. } => "unknown_module",
            DeployError::DependencyCycle { .. } => "dependency_cycle",
            DeployError::CommandExecution { .. } => "command_execution",
            DeployError::RetryBudgetExhausted { .. } => "retry_budget_exhausted",
            DeployError::SourceUpdate(_) => "source_update",
            DeployError::Cancelled => "cancelled",
            DeployError::Watermark(_) => "watermark",
        }
    }
}

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

/// 统一 API 错误类型
#[derive(Debug, Error)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失）
    #[error("Unauthorized")]
    Unauthorized,
    /// 404 - 资源未找到
    #[error("Not found: {0}")]
    NotFound(String),
    /// 400 - 请求无效
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid or missing API key".to_string(),
            ),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("{} not found", resource),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
        };

        let body = ErrorResponse::new(error_type, message);
        (status, Json(body)).into_response()
    }
}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_request_response() {
        let response = ApiError::bad_request("missing field `ref`").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_cycle_error_message() {
        let err = DeployError::DependencyCycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
        assert!(err.is_resolution_error());
        assert_eq!(err.kind(), "dependency_cycle");
    }

    #[test]
    fn test_retry_budget_message() {
        let err = DeployError::RetryBudgetExhausted {
            action: Action::Copy,
            failures: 2,
            attempts: 3,
        };
        assert!(!err.is_resolution_error());
        assert!(err.to_string().contains("copy stage"));
    }
}
