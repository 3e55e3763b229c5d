//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::domain::trigger::RepoPolicy;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 服务监听端口
    pub port: u16,
    /// 模块清单路径
    pub manifest_path: PathBuf,
    /// 源码工作目录
    pub repo_dir: PathBuf,
    /// 数据目录（水位线文件）
    pub data_dir: PathBuf,
    /// 仓库授权策略
    pub repo: RepoPolicy,
    /// 源码更新命令
    pub update_command: String,
    /// 执行参数
    pub execution: ExecutionConfig,
    /// 命令模板变量
    pub templates: TemplateConfig,
    /// 报告回调 URL
    pub callback_url: Option<String>,
    /// 重启确认通道的 API Key（未配置则不校验）
    pub confirm_api_key: Option<String>,
}

/// 执行参数（并发、重试、超时）
#[derive(Clone, Debug)]
pub struct ExecutionConfig {
    /// 工作池大小
    pub max_parallel: usize,
    /// 每个阶段的最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 重试间隔
    pub retry_backoff: Duration,
    /// 单条命令超时
    pub command_timeout: Duration,
    /// 重启确认等待时长
    pub confirm_timeout: Duration,
    /// 运行级超时
    pub run_timeout: Duration,
    /// 传给子进程的 PATH
    pub path_env: Option<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(2000),
            command_timeout: Duration::from_secs(300),
            confirm_timeout: Duration::from_secs(120),
            run_timeout: Duration::from_secs(constants::RUN_TIMEOUT_SECS),
            path_env: None,
        }
    }
}

/// 命令模板变量
#[derive(Clone, Debug)]
pub struct TemplateConfig {
    /// `%user%`
    pub remote_user: String,
    /// `%keypath%`
    pub key_path: String,
    /// 远程包装模板，包含 `%command%`
    pub remote_wrapper: Option<String>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            remote_user: "deploy".to_string(),
            key_path: String::new(),
            remote_wrapper: None,
        }
    }
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let port = parse_var("PORT").unwrap_or(9876);

        let manifest_path = env::var("DEPLOY_MANIFEST")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("deployment-modules.json"));

        let repo_dir = env::var("DEPLOY_REPO_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let repo = RepoPolicy {
            repository: non_empty_var("DEPLOY_REPOSITORY"),
            branch: non_empty_var("DEPLOY_BRANCH").unwrap_or_else(|| "production".to_string()),
            authorized_users: env::var("DEPLOY_AUTHORIZED_USERS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
        };

        let update_command =
            non_empty_var("DEPLOY_UPDATE_COMMAND").unwrap_or_else(|| "git pull".to_string());

        let execution = ExecutionConfig::from_env();
        let templates = TemplateConfig::from_env();

        let callback_url = non_empty_var("DEPLOY_CALLBACK_URL");
        let confirm_api_key = non_empty_var("DEPLOY_CONFIRM_API_KEY");
        if confirm_api_key.is_none() {
            warn!("DEPLOY_CONFIRM_API_KEY not set, restart confirmations are accepted without authentication");
        }

        Self {
            port,
            manifest_path,
            repo_dir,
            data_dir: data_dir(),
            repo,
            update_command,
            execution,
            templates,
            callback_url,
            confirm_api_key,
        }
    }
}

impl ExecutionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_parallel = parse_var("DEPLOY_MAX_PARALLEL")
            .unwrap_or(defaults.max_parallel)
            .max(1);
        let max_attempts = parse_var("DEPLOY_MAX_ATTEMPTS")
            .unwrap_or(defaults.max_attempts)
            .max(1);

        Self {
            max_parallel,
            max_attempts,
            retry_backoff: parse_var("DEPLOY_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            command_timeout: parse_var("DEPLOY_COMMAND_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.command_timeout),
            confirm_timeout: parse_var("DEPLOY_CONFIRM_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.confirm_timeout),
            run_timeout: parse_var("DEPLOY_RUN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.run_timeout),
            path_env: non_empty_var("DEPLOY_PATH_ENV"),
        }
    }
}

impl TemplateConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            remote_user: non_empty_var("DEPLOY_REMOTE_USER").unwrap_or(defaults.remote_user),
            key_path: env::var("DEPLOY_KEY_PATH").unwrap_or_default(),
            remote_wrapper: non_empty_var("DEPLOY_REMOTE_WRAPPER"),
        }
    }
}

/// 数据目录：环境变量 > 可执行文件目录 > 默认目录
fn data_dir() -> PathBuf {
    if let Ok(dir) = env::var("DEPLOY_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Ok(exe_path) = env::current_exe() {
        if let Some(parent) = exe_path.parent() {
            return parent.to_path_buf();
        }
    }

    PathBuf::from("/opt/hook-deployer")
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// 解析逗号分隔列表
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// 常量
pub mod constants {
    /// 运行级超时（秒）
    pub const RUN_TIMEOUT_SECS: u64 = 1800; // 30 分钟

    /// 运行历史最大保存数量
    pub const MAX_RUN_HISTORY: usize = 100;

    /// 水位线文件名
    pub const WATERMARK_FILE_NAME: &str = "last-deployed.json";

    /// 报告中 stderr 摘要的最大长度
    pub const MAX_REASON_LEN: usize = 512;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
