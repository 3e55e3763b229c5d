//! 单次运行的可变状态
//!
//! 每次运行独立创建并显式传递，不存在进程级的全局跟踪表。
//! 待确认集合由执行器/协调器写入，确认通道和最终报告读取。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::deploy::PipelineState;
use crate::domain::report::{CommandFailure, PlannedCommand};
use crate::domain::trigger::Trigger;

/// 运行状态
pub struct RunState {
    pub run_id: String,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    /// 运行级取消（超时或关闭）
    pub cancel: CancellationToken,
    phase: RwLock<PipelineState>,
    /// 已发出重启、尚未确认的服务
    pending: watch::Sender<BTreeSet<String>>,
    /// 当前失败、可重试的命令
    failed_commands: Mutex<Vec<CommandFailure>>,
    retry_attempt: AtomicU32,
}

/// 对外展示的快照
#[derive(Clone, Debug, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub pusher: String,
    pub state: PipelineState,
    pub pending_confirmations: Vec<String>,
    pub failed_commands: Vec<CommandFailure>,
    pub retry_attempt: u32,
    pub started_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, trigger: Trigger, cancel: CancellationToken) -> Self {
        let (pending, _) = watch::channel(BTreeSet::new());
        Self {
            run_id: run_id.into(),
            trigger,
            started_at: Utc::now(),
            cancel,
            phase: RwLock::new(PipelineState::Idle),
            pending,
            failed_commands: Mutex::new(Vec::new()),
            retry_attempt: AtomicU32::new(0),
        }
    }

    pub async fn phase(&self) -> PipelineState {
        *self.phase.read().await
    }

    pub async fn set_phase(&self, state: PipelineState) {
        let mut phase = self.phase.write().await;
        debug!(run_id = %self.run_id, from = %*phase, to = %state, "Pipeline transition");
        *phase = state;
    }

    // ========== 重启确认 ==========

    /// 记录已发出重启
    pub fn mark_pending(&self, module: &str) {
        self.pending.send_modify(|pending| {
            pending.insert(module.to_string());
        });
    }

    /// 重启命令失败时撤回
    pub fn unmark_pending(&self, module: &str) {
        self.pending.send_if_modified(|pending| pending.remove(module));
    }

    /// 确认服务已启动；不在待确认集合中时为 no-op
    pub fn confirm(&self, entity_name: &str) -> bool {
        let removed = self.pending.send_if_modified(|pending| pending.remove(entity_name));
        if removed {
            info!(run_id = %self.run_id, module = %entity_name, "Restart confirmed");
        } else {
            debug!(run_id = %self.run_id, module = %entity_name, "Unexpected confirmation ignored");
        }
        removed
    }

    pub fn pending_confirmations(&self) -> Vec<String> {
        self.pending.borrow().iter().cloned().collect()
    }

    /// 等待所有确认到达，超时或取消后返回仍未确认的服务
    pub async fn wait_for_confirmations(&self, timeout: Duration) -> Vec<String> {
        let mut rx = self.pending.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if rx.borrow_and_update().is_empty() {
                break;
            }
            tokio::select! {
                changed = tokio::time::timeout_at(deadline, rx.changed()) => {
                    if !matches!(changed, Ok(Ok(()))) {
                        break;
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
        self.pending_confirmations()
    }

    // ========== 失败命令 ==========

    /// 记录失败（同一目标只保留最新一次）
    pub async fn record_failure(&self, failure: CommandFailure) {
        let mut failed = self.failed_commands.lock().await;
        match failed.iter_mut().find(|f| {
            f.module == failure.module && f.location == failure.location && f.action == failure.action
        }) {
            Some(existing) => *existing = failure,
            None => failed.push(failure),
        }
    }

    /// 重试成功后移除
    pub async fn clear_failure(&self, planned: &PlannedCommand) {
        let mut failed = self.failed_commands.lock().await;
        failed.retain(|f| !f.matches(planned));
    }

    pub async fn failed_commands(&self) -> Vec<CommandFailure> {
        self.failed_commands.lock().await.clone()
    }

    pub fn retry_attempt(&self) -> u32 {
        self.retry_attempt.load(Ordering::Relaxed)
    }

    pub fn set_retry_attempt(&self, attempt: u32) {
        self.retry_attempt.store(attempt, Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            git_ref: self.trigger.git_ref.clone(),
            pusher: self.trigger.pusher_name.clone(),
            state: self.phase().await,
            pending_confirmations: self.pending_confirmations(),
            failed_commands: self.failed_commands().await,
            retry_attempt: self.retry_attempt(),
            started_at: self.started_at,
        }
    }
}
