//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::env::constants::{MAX_RUN_HISTORY, WATERMARK_FILE_NAME};
use crate::config::EnvConfig;
use crate::domain::module::ModuleRegistry;
use crate::infra::{FanoutReportSink, FileWatermarkStore, GitSource, ShellExecutor};
use crate::services::deploy::{Dispatcher, Pipeline, PipelineDeps};

use super::run_history::RunHistory;

/// 全局 shutdown token，用于优雅关闭所有后台任务
static GLOBAL_SHUTDOWN: std::sync::OnceLock<CancellationToken> = std::sync::OnceLock::new();

/// 获取全局 shutdown token
pub fn get_shutdown_token() -> CancellationToken {
    GLOBAL_SHUTDOWN.get_or_init(CancellationToken::new).clone()
}

/// 触发全局 shutdown
pub fn trigger_shutdown() {
    if let Some(token) = GLOBAL_SHUTDOWN.get() {
        token.cancel();
    }
}

/// 应用状态
pub struct AppState {
    /// 环境配置
    pub config: EnvConfig,
    /// 模块注册表（只读）
    pub registry: Arc<ModuleRegistry>,
    /// 运行调度器
    pub dispatcher: Arc<Dispatcher>,
    /// 已完成运行的历史
    pub history: Arc<RunHistory>,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// 按配置装配生产依赖
    pub fn new(config: EnvConfig, registry: ModuleRegistry) -> anyhow::Result<Self> {
        let registry = Arc::new(registry);
        let execution = config.execution.clone();

        let executor = Arc::new(
            ShellExecutor::new(&config.repo_dir).with_path_env(execution.path_env.clone()),
        );
        let source = Arc::new(GitSource::new(
            executor.clone(),
            config.update_command.clone(),
            execution.command_timeout,
        ));
        let watermark = Arc::new(FileWatermarkStore::new(
            config.data_dir.join(WATERMARK_FILE_NAME),
        ));
        let sink = Arc::new(FanoutReportSink::from_callback(config.callback_url.as_deref())?);

        tracing::info!(
            port = config.port,
            repo_dir = %config.repo_dir.display(),
            data_dir = %config.data_dir.display(),
            branch = %config.repo.branch,
            authorized_users = config.repo.authorized_users.len(),
            max_parallel = execution.max_parallel,
            max_attempts = execution.max_attempts,
            callback_url = ?config.callback_url,
            report_sinks = sink.sink_count(),
            modules = registry.len(),
            "Loaded configuration"
        );

        let pipeline = Pipeline::new(
            registry.clone(),
            PipelineDeps {
                executor,
                source,
                watermark,
                sink,
            },
            execution,
            config.templates.clone(),
        );

        Ok(Self::with_pipeline(config, pipeline))
    }

    /// 使用已装配的流水线创建
    pub fn with_pipeline(config: EnvConfig, pipeline: Pipeline) -> Self {
        let registry = pipeline.registry().clone();
        let history = Arc::new(RunHistory::new(MAX_RUN_HISTORY));
        let dispatcher = Dispatcher::new(
            Arc::new(pipeline),
            history.clone(),
            config.execution.run_timeout,
            get_shutdown_token(),
        );

        Self {
            config,
            registry,
            dispatcher,
            history,
            started_at: Utc::now(),
        }
    }
}
