//! 运行报告
//!
//! 每次运行无论成败都产出且只产出一份报告。

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::deploy::{DeployStage, DeployStatus, PipelineState};
use super::graph::{Action, ActionNode, ActionSet};

/// 已渲染、待执行的命令
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlannedCommand {
    pub module: String,
    pub location: String,
    pub action: Action,
    pub command: String,
}

impl PlannedCommand {
    /// 同一 (模块, 位置, 动作) 在一次运行中唯一
    pub fn same_target(&self, other: &PlannedCommand) -> bool {
        self.module == other.module && self.location == other.location && self.action == other.action
    }
}

/// 失败命令记录
#[derive(Clone, Debug, Serialize)]
pub struct CommandFailure {
    pub module: String,
    pub location: String,
    pub action: Action,
    pub command: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// 失败原因摘要（stderr 尾部或错误信息）
    pub reason: String,
    pub attempts: u32,
}

impl CommandFailure {
    pub fn from_planned(planned: &PlannedCommand, exit_code: Option<i32>, timed_out: bool, reason: String, attempts: u32) -> Self {
        Self {
            module: planned.module.clone(),
            location: planned.location.clone(),
            action: planned.action,
            command: planned.command.clone(),
            exit_code,
            timed_out,
            reason,
            attempts,
        }
    }

    pub fn matches(&self, planned: &PlannedCommand) -> bool {
        self.module == planned.module && self.location == planned.location && self.action == planned.action
    }
}

/// 报告中的节点摘要
#[derive(Clone, Debug, Serialize)]
pub struct NodeSummary {
    pub module: String,
    pub actions: ActionSet,
    pub depth: usize,
}

impl From<&ActionNode> for NodeSummary {
    fn from(node: &ActionNode) -> Self {
        Self {
            module: node.module.clone(),
            actions: node.actions.clone(),
            depth: node.depth,
        }
    }
}

/// 重启未确认告警
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RestartNotConfirmed {
    pub module: String,
}

/// 运行报告
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub run_id: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub pusher: String,
    pub status: DeployStatus,
    /// 结束时所处状态（成功为 IDLE 前的最后状态，失败为 FAILED）
    pub final_state: PipelineState,
    /// 失败时进入 FAILED 之前的状态
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_in: Option<PipelineState>,
    pub revision: Option<String>,
    pub previous_revision: Option<String>,
    pub changed_modules: Vec<String>,
    pub actions_taken: Vec<NodeSummary>,
    pub commands_executed: Vec<String>,
    pub failures: Vec<CommandFailure>,
    pub pending_confirmations: Vec<RestartNotConfirmed>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    pub stages: Vec<DeployStage>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, git_ref: impl Into<String>, pusher: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            git_ref: git_ref.into(),
            pusher: pusher.into(),
            status: DeployStatus::Running,
            final_state: PipelineState::Idle,
            failed_in: None,
            revision: None,
            previous_revision: None,
            changed_modules: Vec::new(),
            actions_taken: Vec::new(),
            commands_executed: Vec::new(),
            failures: Vec::new(),
            pending_confirmations: Vec::new(),
            error: None,
            error_kind: None,
            stages: DeployStage::pipeline_stages(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DeployStatus::Success
    }

    pub fn pending_modules(&self) -> Vec<&str> {
        self.pending_confirmations.iter().map(|p| p.module.as_str()).collect()
    }

    /// 按名称取阶段
    pub fn stage_mut(&mut self, name: &str) -> Option<&mut DeployStage> {
        self.stages.iter_mut().find(|s| s.name == name)
    }
}
