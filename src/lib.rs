//! Hook Deployer - webhook 驱动的部署编排器
//!
//! 收到生产分支 push 后：更新源码、映射变更模块、解析依赖图，
//! 按 copy → install → restart 分阶段在所有位置执行命令。

pub mod error;
pub mod middleware;
pub mod infra;
pub mod domain;
pub mod config;
pub mod state;
pub mod api;
pub mod services;

#[cfg(test)]
pub(crate) mod testing;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{load_registry, EnvConfig};
use crate::domain::trigger::Trigger;
use crate::state::app_state::{trigger_shutdown, AppState};

/// 命令行覆盖项
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// 覆盖监听端口
    pub port_override: Option<u16>,
    /// 覆盖模块清单路径
    pub manifest_override: Option<PathBuf>,
    /// 启动时按水位线 diff 执行一次部署
    pub deploy_on_start: bool,
}

/// 初始化日志、加载配置并运行 HTTP 服务，直到收到 Ctrl-C
pub async fn init_and_run_with_config(runtime: RuntimeConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hook_deployer=info,tower_http=info")),
        )
        .init();

    let mut config = EnvConfig::from_env();
    if let Some(port) = runtime.port_override {
        config.port = port;
    }
    if let Some(path) = runtime.manifest_override {
        config.manifest_path = path;
    }

    info!(
        version = config::env::constants::VERSION,
        manifest = %config.manifest_path.display(),
        "Starting hook deployer"
    );

    // 清单无效时拒绝启动
    let registry = load_registry(&config.manifest_path)?;
    let port = config.port;
    let state = Arc::new(AppState::new(config, registry)?);

    if runtime.deploy_on_start {
        let outcome = state.dispatcher.submit(Trigger::startup()).await;
        info!(outcome = outcome.as_str(), run_id = ?outcome.run_id(), "Startup deployment submitted");
    }

    let app = api::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Hook deployer stopped");
    Ok(())
}

/// 向部署服务上报一次重启确认（供被部署的服务在启动脚本中调用）
///
/// 地址优先级：`server_url` 参数 > `DEPLOY_SERVER_URL` > `http://127.0.0.1:$PORT`
pub async fn send_confirmation(entity_name: &str, server_url: Option<String>) -> anyhow::Result<bool> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hook_deployer=warn")),
        )
        .init();

    let config = EnvConfig::from_env();
    let base_url = server_url
        .or_else(|| std::env::var("DEPLOY_SERVER_URL").ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| format!("http://127.0.0.1:{}", config.port));

    let client = infra::ConfirmationClient::new(&base_url, config.confirm_api_key)?;
    client.confirm_restart(entity_name).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received, cancelling active run");
    trigger_shutdown();
}
