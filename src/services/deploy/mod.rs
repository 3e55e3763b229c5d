//! 部署服务模块
//!
//! 调度器保证同一时刻最多一个运行；运行期间到达的触发合并进唯一的等待槽，
//! 当前运行结束后再启动。

pub mod context;
pub mod pipeline;
pub mod restart;
pub mod stage;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::domain::trigger::Trigger;
use crate::state::run_history::RunHistory;
use crate::state::run_state::RunState;

pub use context::RunContext;
pub use pipeline::{Pipeline, PipelineDeps};
pub use restart::{RestartCoordinator, RestartResult};
pub use stage::{StageExecutor, StageResult};

/// 提交触发的结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// 立即开始运行
    Started { run_id: String },
    /// 进入等待槽
    Queued,
    /// 与等待槽中的触发合并
    Coalesced,
}

impl SubmitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitOutcome::Started { .. } => "started",
            SubmitOutcome::Queued => "queued",
            SubmitOutcome::Coalesced => "coalesced",
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Started { run_id } => Some(run_id),
            _ => None,
        }
    }
}

#[derive(Default)]
struct DispatchState {
    active: Option<Arc<RunState>>,
    pending: Option<Trigger>,
}

/// 运行调度器
pub struct Dispatcher {
    pipeline: Arc<Pipeline>,
    history: Arc<RunHistory>,
    run_timeout: Duration,
    shutdown: CancellationToken,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new(
        pipeline: Arc<Pipeline>,
        history: Arc<RunHistory>,
        run_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            history,
            run_timeout,
            shutdown,
            state: Mutex::new(DispatchState::default()),
        })
    }

    /// 提交一个已授权的触发
    pub async fn submit(self: &Arc<Self>, trigger: Trigger) -> SubmitOutcome {
        let mut state = self.state.lock().await;

        if let Some(ref active) = state.active {
            let active_id = active.run_id.clone();
            return match state.pending {
                Some(ref mut pending) => {
                    pending.coalesce(trigger);
                    info!(active_run = %active_id, paths = pending.changed_paths.len(), "Coalesced trigger into pending slot");
                    SubmitOutcome::Coalesced
                }
                None => {
                    info!(active_run = %active_id, git_ref = %trigger.git_ref, "Deployment queued");
                    state.pending = Some(trigger);
                    SubmitOutcome::Queued
                }
            };
        }

        let run = self.new_run(trigger);
        let run_id = run.run_id.clone();
        state.active = Some(run.clone());
        drop(state);

        tokio::spawn(self.clone().drive(run));
        SubmitOutcome::Started { run_id }
    }

    /// 当前活动运行
    pub async fn current(&self) -> Option<Arc<RunState>> {
        self.state.lock().await.active.clone()
    }

    pub async fn has_pending(&self) -> bool {
        self.state.lock().await.pending.is_some()
    }

    /// 把重启确认交给当前运行；没有运行或服务不在待确认集合中时为 no-op
    pub async fn confirm(&self, entity_name: &str) -> bool {
        match self.current().await {
            Some(run) => run.confirm(entity_name),
            None => false,
        }
    }

    fn new_run(&self, trigger: Trigger) -> Arc<RunState> {
        let run_id = uuid::Uuid::new_v4().to_string();
        Arc::new(RunState::new(run_id, trigger, self.shutdown.child_token()))
    }

    /// 执行运行，结束后处理等待槽
    async fn drive(self: Arc<Self>, mut run: Arc<RunState>) {
        loop {
            self.execute_single(run).await;

            let mut state = self.state.lock().await;
            match state.pending.take() {
                Some(trigger) if !self.shutdown.is_cancelled() => {
                    let next = self.new_run(trigger);
                    info!(
                        run_id = %next.run_id,
                        git_ref = %next.trigger.git_ref,
                        "Starting queued deployment"
                    );
                    state.active = Some(next.clone());
                    run = next;
                }
                _ => {
                    state.active = None;
                    break;
                }
            }
        }
    }

    async fn execute_single(&self, run: Arc<RunState>) {
        let timeout_task = spawn_timeout(run.run_id.clone(), self.run_timeout, run.cancel.clone());
        let report = self.pipeline.run(run).await;
        timeout_task.abort();
        self.history.push(report).await;
    }
}

/// 运行级超时：到期取消运行，正在执行的命令被 kill
fn spawn_timeout(run_id: String, timeout: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                error!(run_id = %run_id, "Deployment run timed out after {:?}", timeout);
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    })
}
