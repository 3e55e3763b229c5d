//! 重启协调
//!
//! 按运行时依赖顺序发出重启：某服务的重启在其所有运行时依赖
//! 已发出（而非已完成或已确认）重启后才开始。发出的重启进入待确认集合，
//! 由确认通道异步移除。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::domain::graph::{Action, ActionNode};
use crate::domain::report::{CommandFailure, PlannedCommand, RestartNotConfirmed};
use crate::error::DeployError;
use crate::services::command_builder::CommandBuilder;
use crate::state::run_state::RunState;

use super::stage::{StageExecutor, StageResult};

/// 重启阶段结果
#[derive(Clone, Debug, Default)]
pub struct RestartResult {
    /// 已成功发出重启的服务（按发出顺序）
    pub issued: Vec<String>,
    pub succeeded: Vec<PlannedCommand>,
    pub failed: Vec<CommandFailure>,
    /// 因运行时依赖始终未发出重启而跳过的服务
    pub blocked: Vec<String>,
    pub attempts: u32,
}

impl RestartResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }
}

/// 重启协调器
pub struct RestartCoordinator {
    stage: Arc<StageExecutor>,
    builder: Arc<CommandBuilder>,
    confirm_timeout: Duration,
}

impl RestartCoordinator {
    pub fn new(stage: Arc<StageExecutor>, builder: Arc<CommandBuilder>, confirm_timeout: Duration) -> Self {
        Self {
            stage,
            builder,
            confirm_timeout,
        }
    }

    /// 执行重启阶段
    ///
    /// 服务的重启命令在首轮全部发出（交给执行器）即视为已发出，依赖它的服务随即可以开始，
    /// 不等待命令退出或重试。发出后最终仍失败的重启记入 `failed`，由流水线按重试预算耗尽处理。
    pub async fn run_restart(&self, nodes: &[ActionNode], run: Arc<RunState>) -> Result<RestartResult, DeployError> {
        let tasks = restart_tasks(nodes);
        let mut result = RestartResult::default();
        if tasks.is_empty() {
            return Ok(result);
        }

        let commands: BTreeMap<&str, Vec<PlannedCommand>> = nodes
            .iter()
            .filter(|n| tasks.contains_key(n.module.as_str()))
            .map(|n| (n.module.as_str(), self.builder.plan_node(n, Action::Restart)))
            .collect();

        let mut issued: BTreeSet<String> = BTreeSet::new();
        let mut started: BTreeSet<String> = BTreeSet::new();
        let mut running: JoinSet<(String, Result<StageResult, DeployError>)> = JoinSet::new();
        let mut issuing: JoinSet<(String, bool)> = JoinSet::new();

        loop {
            for (name, prereqs) in &tasks {
                if started.contains(*name) || !prereqs.iter().all(|p| issued.contains(*p)) {
                    continue;
                }

                started.insert(name.to_string());
                let planned = commands.get(name).cloned().unwrap_or_default();
                let stage = self.stage.clone();
                let run = run.clone();
                let module = name.to_string();
                let (dispatched_tx, dispatched_rx) = oneshot::channel();

                info!(run_id = %run.run_id, module = %module, commands = planned.len(), "Issuing restart");
                running.spawn(async move {
                    // 先登记再发命令，避免确认先于登记到达
                    if !planned.is_empty() {
                        run.mark_pending(&module);
                    }
                    let outcome = stage
                        .run_stage_notify(planned, Action::Restart, &run, Some(dispatched_tx))
                        .await;
                    if !matches!(outcome, Ok(ref r) if r.is_success()) {
                        run.unmark_pending(&module);
                    }
                    (module, outcome)
                });

                let module = name.to_string();
                issuing.spawn(async move { (module, dispatched_rx.await.is_ok()) });
            }

            tokio::select! {
                Some(joined) = issuing.join_next() => match joined {
                    Ok((module, true)) => {
                        debug!(run_id = %run.run_id, module = %module, "Restart issued");
                        issued.insert(module.clone());
                        result.issued.push(module);
                    }
                    Ok((module, false)) => {
                        warn!(run_id = %run.run_id, module = %module, "Restart ended before it was issued");
                    }
                    Err(e) => error!(run_id = %run.run_id, error = %e, "Restart issue watcher panicked"),
                },
                Some(joined) = running.join_next() => {
                    let (module, outcome) = match joined {
                        Ok(v) => v,
                        Err(e) => {
                            error!(run_id = %run.run_id, error = %e, "Restart task panicked");
                            continue;
                        }
                    };

                    let stage_result = outcome?;
                    result.attempts = result.attempts.max(stage_result.attempts);
                    result.succeeded.extend(stage_result.succeeded);
                    if !stage_result.failed.is_empty() {
                        error!(
                            run_id = %run.run_id,
                            module = %module,
                            failures = stage_result.failed.len(),
                            "Restart failed"
                        );
                        result.failed.extend(stage_result.failed);
                    }
                }
                else => break,
            }
        }

        // 运行时依赖始终未发出的服务不会被重启
        result.blocked = tasks
            .keys()
            .filter(|name| !started.contains(**name))
            .map(|name| name.to_string())
            .collect();
        for module in &result.blocked {
            warn!(run_id = %run.run_id, module = %module, "Restart blocked by unissued runtime dependency");
        }
        Ok(result)
    }

    /// 等待重启确认，超时后返回未确认的服务
    pub async fn await_confirmations(&self, run: &RunState) -> Vec<RestartNotConfirmed> {
        let pending = run.pending_confirmations();
        if pending.is_empty() {
            return Vec::new();
        }

        info!(
            run_id = %run.run_id,
            pending = ?pending,
            timeout_secs = self.confirm_timeout.as_secs(),
            "Awaiting restart confirmations"
        );
        let remaining = run.wait_for_confirmations(self.confirm_timeout).await;
        for module in &remaining {
            warn!(run_id = %run.run_id, module = %module, "Restart not confirmed before timeout");
        }
        remaining
            .into_iter()
            .map(|module| RestartNotConfirmed { module })
            .collect()
    }
}

/// 重启任务图：服务名 -> 同样需要重启的运行时依赖
fn restart_tasks(nodes: &[ActionNode]) -> BTreeMap<&str, BTreeSet<&str>> {
    let restarting: BTreeSet<&str> = nodes
        .iter()
        .filter(|n| n.requires(Action::Restart))
        .map(|n| n.module.as_str())
        .collect();

    nodes
        .iter()
        .filter(|n| n.requires(Action::Restart))
        .map(|n| {
            let prereqs = n
                .runtime_depends_on
                .iter()
                .map(String::as_str)
                .filter(|d| restarting.contains(d))
                .collect();
            (n.module.as_str(), prereqs)
        })
        .collect()
}
