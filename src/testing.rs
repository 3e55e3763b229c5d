//! 测试辅助：可编排的执行器、内存水位线、收集型报告接收方、静态源码仓库

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{ExecutionConfig, TemplateConfig};
use crate::domain::module::{CommandTemplates, Dependency, Module, ModuleRegistry};
use crate::domain::report::RunReport;
use crate::error::DeployError;
use crate::infra::command::{CommandError, CommandExecutor, ExecOutput};
use crate::infra::report_sink::ReportSink;
use crate::infra::source::SourceControl;
use crate::infra::watermark::WatermarkStore;

pub(crate) fn paths(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub(crate) fn names(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// 毫秒级重试/确认超时
pub(crate) fn fast_execution() -> ExecutionConfig {
    ExecutionConfig {
        max_parallel: 4,
        max_attempts: 3,
        retry_backoff: Duration::from_millis(5),
        command_timeout: Duration::from_secs(5),
        confirm_timeout: Duration::from_millis(100),
        run_timeout: Duration::from_secs(30),
        path_env: None,
    }
}

pub(crate) fn templates() -> TemplateConfig {
    TemplateConfig {
        remote_user: "deploy".to_string(),
        key_path: "/keys/deploy".to_string(),
        remote_wrapper: None,
    }
}

/// 命令模板形如 `copy <module>@%location%`，便于断言
fn scripted_commands(name: &str, copy: bool) -> CommandTemplates {
    CommandTemplates {
        copy: copy.then(|| format!("copy {}@%location%", name)),
        install: copy.then(|| format!("install {}@%location%", name)),
        restart: Some(format!("restart {}@%location%", name)),
        ..Default::default()
    }
}

/// core(library) <- api(server) <- gateway(server)；worker 对 core 为 soft 依赖
pub(crate) fn sample_registry() -> Arc<ModuleRegistry> {
    Arc::new(ModuleRegistry::new(vec![
        Module::library("core")
            .with_paths(["lib/core"])
            .with_commands(CommandTemplates {
                restart: None,
                ..scripted_commands("core", true)
            }),
        Module::server("api")
            .with_paths(["srv/api"])
            .with_dependency(Dependency::hard("core"))
            .with_locations(["app1", "app2"])
            .with_commands(scripted_commands("api", true)),
        Module::server("gateway")
            .with_paths(["srv/gateway"])
            .with_dependency(Dependency::hard("api"))
            .with_locations(["edge1"])
            .with_commands(scripted_commands("gateway", true)),
        Module::server("worker")
            .with_paths(["srv/worker"])
            .with_dependency(Dependency::soft("core"))
            .with_locations(["jobs1"])
            .with_commands(scripted_commands("worker", false)),
    ]))
}

/// 重启协调测试用的服务集合（每个服务单一位置）
pub(crate) fn restart_registry() -> Arc<ModuleRegistry> {
    let server = |name: &str, location: &str| {
        Module::server(name)
            .with_locations([location])
            .with_commands(scripted_commands(name, false))
    };
    Arc::new(ModuleRegistry::new(vec![
        server("db", "db1"),
        server("api", "app1").with_dependency(Dependency::hard("db")),
        server("gateway", "edge1").with_dependency(Dependency::hard("api")),
        server("worker", "jobs1"),
    ]))
}

/// 按命令返回预设结果的执行器
///
/// 每条命令依次消费预设结果，最后一个结果重复使用；未预设的命令成功。
#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<ExecOutput>>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
    command_delays: Mutex<HashMap<String, Duration>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 单条命令的执行耗时，优先于 `with_delay`
    pub(crate) fn delay_command(&self, command: &str, delay: Duration) {
        self.command_delays
            .lock()
            .unwrap()
            .insert(command.to_string(), delay);
    }

    pub(crate) fn respond(&self, command: &str, outputs: Vec<ExecOutput>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(command.to_string(), outputs.into());
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self, command: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == command).count()
    }

    pub(crate) fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_output(&self, command: &str) -> ExecOutput {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(command) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| ExecOutput::ok("")),
            None => ExecOutput::ok(""),
        }
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        command: &str,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, CommandError> {
        self.calls.lock().unwrap().push(command.to_string());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let delay = self
            .command_delays
            .lock()
            .unwrap()
            .get(command)
            .copied()
            .or(self.delay);
        let result = match delay {
            Some(delay) => tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(self.next_output(command)),
                _ = cancel.cancelled() => Err(CommandError::Cancelled),
            },
            None if cancel.is_cancelled() => Err(CommandError::Cancelled),
            None => Ok(self.next_output(command)),
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// 内存水位线
#[derive(Default)]
pub(crate) struct MemoryWatermark {
    revision: Mutex<Option<String>>,
}

impl MemoryWatermark {
    pub(crate) fn new(revision: Option<&str>) -> Self {
        Self {
            revision: Mutex::new(revision.map(String::from)),
        }
    }

    pub(crate) fn current(&self) -> Option<String> {
        self.revision.lock().unwrap().clone()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermark {
    async fn read_last_revision(&self) -> Option<String> {
        self.current()
    }

    async fn write_last_revision(&self, revision: &str) -> anyhow::Result<()> {
        *self.revision.lock().unwrap() = Some(revision.to_string());
        Ok(())
    }
}

/// 收集所有报告
#[derive(Default)]
pub(crate) struct CollectingReportSink {
    reports: Mutex<Vec<RunReport>>,
}

impl CollectingReportSink {
    pub(crate) fn reports(&self) -> Vec<RunReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportSink for CollectingReportSink {
    async fn send_report(&self, report: &RunReport) -> anyhow::Result<()> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

/// 固定 HEAD 的源码仓库
pub(crate) struct StaticSource {
    head: String,
    diff: Mutex<Vec<String>>,
    fail_update: AtomicBool,
    updates: AtomicUsize,
    diff_requests: AtomicUsize,
}

impl StaticSource {
    pub(crate) fn new(head: &str) -> Self {
        Self {
            head: head.to_string(),
            diff: Mutex::new(Vec::new()),
            fail_update: AtomicBool::new(false),
            updates: AtomicUsize::new(0),
            diff_requests: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_diff(&self, paths: Vec<String>) {
        *self.diff.lock().unwrap() = paths;
    }

    pub(crate) fn fail_update(&self) {
        self.fail_update.store(true, Ordering::SeqCst);
    }

    pub(crate) fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub(crate) fn diff_requests(&self) -> usize {
        self.diff_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceControl for StaticSource {
    async fn update(&self, _cancel: &CancellationToken) -> Result<(), DeployError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(DeployError::SourceUpdate("git pull: exit code 1: could not resolve host".to_string()));
        }
        Ok(())
    }

    async fn head_revision(&self, _cancel: &CancellationToken) -> Result<String, DeployError> {
        Ok(self.head.clone())
    }

    async fn changed_since(&self, _revision: &str, _cancel: &CancellationToken) -> Result<Vec<String>, DeployError> {
        self.diff_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.diff.lock().unwrap().clone())
    }
}

/// API 测试用的应用状态：仓库 `platform`、生产分支 `production`、仅 alice 可部署
pub(crate) fn app_state(confirm_api_key: Option<&str>) -> crate::state::AppState {
    use crate::config::EnvConfig;
    use crate::domain::trigger::RepoPolicy;
    use crate::services::deploy::{Pipeline, PipelineDeps};

    let mut execution = fast_execution();
    execution.confirm_timeout = Duration::from_secs(5);

    let config = EnvConfig {
        port: 0,
        manifest_path: "deployment-modules.json".into(),
        repo_dir: ".".into(),
        data_dir: std::env::temp_dir(),
        repo: RepoPolicy {
            repository: Some("platform".to_string()),
            branch: "production".to_string(),
            authorized_users: vec!["alice".to_string()],
        },
        update_command: "git pull".to_string(),
        execution: execution.clone(),
        templates: templates(),
        callback_url: None,
        confirm_api_key: confirm_api_key.map(String::from),
    };

    let pipeline = Pipeline::new(
        sample_registry(),
        PipelineDeps {
            executor: Arc::new(ScriptedExecutor::new()),
            source: Arc::new(StaticSource::new("rev-2")),
            watermark: Arc::new(MemoryWatermark::new(Some("rev-1"))),
            sink: Arc::new(CollectingReportSink::default()),
        },
        execution,
        templates(),
    );

    crate::state::AppState::with_pipeline(config, pipeline)
}
