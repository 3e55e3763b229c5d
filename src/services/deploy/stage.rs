//! 阶段执行器
//!
//! 以有界并发执行一组同类命令（全部 copy 或全部 install），
//! 失败命令不阻塞同批其他命令，按轮次重试直到成功或预算耗尽。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::env::constants::MAX_REASON_LEN;
use crate::config::ExecutionConfig;
use crate::domain::graph::Action;
use crate::domain::report::{CommandFailure, PlannedCommand};
use crate::error::DeployError;
use crate::infra::command::{CommandError, CommandExecutor, ExecOutput};
use crate::state::run_state::RunState;

/// 阶段结果
#[derive(Clone, Debug, Default)]
pub struct StageResult {
    pub succeeded: Vec<PlannedCommand>,
    pub failed: Vec<CommandFailure>,
    /// 实际执行的轮数
    pub attempts: u32,
}

impl StageResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// 单条命令的执行结果
enum Outcome {
    Succeeded,
    Failed(CommandFailure),
    Cancelled(CommandFailure),
}

/// 一批命令全部交给执行器（拿到工作池名额）后发出一次通知
struct DispatchNotice {
    remaining: AtomicUsize,
    sender: Mutex<Option<oneshot::Sender<()>>>,
}

impl DispatchNotice {
    fn new(sender: oneshot::Sender<()>, count: usize) -> Arc<Self> {
        let notice = Arc::new(Self {
            remaining: AtomicUsize::new(count),
            sender: Mutex::new(Some(sender)),
        });
        if count == 0 {
            notice.fire();
        }
        notice
    }

    fn dispatched(&self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.fire();
        }
    }

    fn fire(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            if let Some(sender) = sender.take() {
                let _ = sender.send(());
            }
        }
    }
}

/// 阶段执行器
///
/// 工作池（信号量）由所有阶段和重启协调器共享，同一时刻运行的命令数不超过 `max_parallel`。
pub struct StageExecutor {
    executor: Arc<dyn CommandExecutor>,
    limiter: Arc<Semaphore>,
    settings: ExecutionConfig,
}

impl StageExecutor {
    pub fn new(executor: Arc<dyn CommandExecutor>, settings: ExecutionConfig) -> Self {
        Self {
            limiter: Arc::new(Semaphore::new(settings.max_parallel.max(1))),
            executor,
            settings,
        }
    }

    /// 执行命令并在预算内重试
    ///
    /// 只有运行被取消时返回错误；预算耗尽后的失败体现在 `StageResult::failed` 中。
    pub async fn run_stage(
        &self,
        commands: Vec<PlannedCommand>,
        action: Action,
        run: &RunState,
    ) -> Result<StageResult, DeployError> {
        self.run_stage_notify(commands, action, run, None).await
    }

    /// 同 [`StageExecutor::run_stage`]，首轮命令全部发出后通过 `dispatched` 通知
    ///
    /// 首轮发出前返回（取消）时 `dispatched` 被丢弃，接收端得到错误。
    pub async fn run_stage_notify(
        &self,
        commands: Vec<PlannedCommand>,
        action: Action,
        run: &RunState,
        dispatched: Option<oneshot::Sender<()>>,
    ) -> Result<StageResult, DeployError> {
        let mut notice = dispatched;
        if commands.is_empty() {
            if let Some(sender) = notice.take() {
                let _ = sender.send(());
            }
        }

        let mut result = StageResult::default();
        let mut outstanding = commands;
        let max_attempts = self.settings.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if outstanding.is_empty() {
                break;
            }
            if run.cancel.is_cancelled() {
                return Err(DeployError::Cancelled);
            }

            run.set_retry_attempt(attempt - 1);
            result.attempts = attempt;
            info!(
                run_id = %run.run_id,
                action = %action,
                commands = outstanding.len(),
                attempt = attempt,
                "Executing stage batch"
            );

            let notice = notice
                .take()
                .map(|sender| DispatchNotice::new(sender, outstanding.len()));
            let outcomes = self.execute_batch(outstanding, attempt, run, notice).await;
            let mut retry = Vec::new();
            let mut last_failures = Vec::new();
            let mut cancelled = false;

            for (planned, outcome) in outcomes {
                match outcome {
                    Outcome::Succeeded => {
                        run.clear_failure(&planned).await;
                        result.succeeded.push(planned);
                    }
                    Outcome::Failed(failure) => {
                        run.record_failure(failure.clone()).await;
                        last_failures.push(failure);
                        retry.push(planned);
                    }
                    Outcome::Cancelled(failure) => {
                        run.record_failure(failure).await;
                        cancelled = true;
                    }
                }
            }

            if cancelled {
                return Err(DeployError::Cancelled);
            }

            outstanding = retry;
            result.failed = last_failures;

            if !outstanding.is_empty() && attempt < max_attempts {
                warn!(
                    run_id = %run.run_id,
                    action = %action,
                    failed = outstanding.len(),
                    attempt = attempt,
                    "Stage has failed commands, retrying after {:?}", self.settings.retry_backoff
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.retry_backoff) => {}
                    _ = run.cancel.cancelled() => return Err(DeployError::Cancelled),
                }
            }
        }

        Ok(result)
    }

    /// 并发执行一批命令，结果按输入顺序返回
    async fn execute_batch(
        &self,
        commands: Vec<PlannedCommand>,
        attempt: u32,
        run: &RunState,
        notice: Option<Arc<DispatchNotice>>,
    ) -> Vec<(PlannedCommand, Outcome)> {
        let mut tasks = JoinSet::new();

        for (index, planned) in commands.iter().cloned().enumerate() {
            let executor = self.executor.clone();
            let limiter = self.limiter.clone();
            let cancel = run.cancel.clone();
            let timeout = self.settings.command_timeout;
            let notice = notice.clone();

            tasks.spawn(async move {
                let result = match limiter.acquire_owned().await {
                    Ok(_permit) => {
                        if let Some(notice) = notice {
                            notice.dispatched();
                        }
                        executor.execute(&planned.command, timeout, &cancel).await
                    }
                    Err(_) => Err(CommandError::Cancelled),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<ExecOutput, CommandError>>> =
            (0..commands.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!(run_id = %run.run_id, error = %e, "Command task panicked"),
            }
        }

        commands
            .into_iter()
            .zip(results)
            .map(|(planned, result)| {
                let outcome = classify(&planned, result, attempt, &run.run_id);
                (planned, outcome)
            })
            .collect()
    }
}

fn classify(
    planned: &PlannedCommand,
    result: Option<Result<ExecOutput, CommandError>>,
    attempt: u32,
    run_id: &str,
) -> Outcome {
    match result {
        Some(Ok(output)) if output.success() => Outcome::Succeeded,
        Some(Ok(output)) => {
            let reason = output.failure_reason(MAX_REASON_LEN);
            let error = DeployError::CommandExecution {
                module: planned.module.clone(),
                location: planned.location.clone(),
                reason: reason.clone(),
            };
            warn!(
                run_id = %run_id,
                action = %planned.action,
                exit_code = ?output.exit_code,
                timed_out = output.timed_out,
                attempt = attempt,
                "{}", error
            );
            Outcome::Failed(CommandFailure::from_planned(
                planned,
                output.exit_code,
                output.timed_out,
                reason,
                attempt,
            ))
        }
        Some(Err(CommandError::Cancelled)) => Outcome::Cancelled(CommandFailure::from_planned(
            planned,
            None,
            false,
            "cancelled".to_string(),
            attempt,
        )),
        Some(Err(e)) => {
            warn!(
                run_id = %run_id,
                module = %planned.module,
                location = %planned.location,
                error = %e,
                "Command could not be executed"
            );
            Outcome::Failed(CommandFailure::from_planned(planned, None, false, e.to_string(), attempt))
        }
        None => Outcome::Failed(CommandFailure::from_planned(
            planned,
            None,
            false,
            "command task aborted".to_string(),
            attempt,
        )),
    }
}
