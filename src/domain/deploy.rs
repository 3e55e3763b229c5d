//! 部署运行相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 流水线状态
///
/// `IDLE → UPDATING_SOURCE → MAPPING_CHANGES → RESOLVING_GRAPH → COPYING →
/// INSTALLING → RESTARTING → AWAITING_CONFIRMATION → PERSISTING_WATERMARK → IDLE`，
/// 任意状态遇到不可恢复错误进入 `FAILED`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Idle,
    UpdatingSource,
    MappingChanges,
    ResolvingGraph,
    Copying,
    Installing,
    Restarting,
    AwaitingConfirmation,
    PersistingWatermark,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "IDLE",
            PipelineState::UpdatingSource => "UPDATING_SOURCE",
            PipelineState::MappingChanges => "MAPPING_CHANGES",
            PipelineState::ResolvingGraph => "RESOLVING_GRAPH",
            PipelineState::Copying => "COPYING",
            PipelineState::Installing => "INSTALLING",
            PipelineState::Restarting => "RESTARTING",
            PipelineState::AwaitingConfirmation => "AWAITING_CONFIRMATION",
            PipelineState::PersistingWatermark => "PERSISTING_WATERMARK",
            PipelineState::Failed => "FAILED",
        }
    }

    /// 正常路径上的下一个状态
    pub fn next(&self) -> PipelineState {
        match self {
            PipelineState::Idle => PipelineState::UpdatingSource,
            PipelineState::UpdatingSource => PipelineState::MappingChanges,
            PipelineState::MappingChanges => PipelineState::ResolvingGraph,
            PipelineState::ResolvingGraph => PipelineState::Copying,
            PipelineState::Copying => PipelineState::Installing,
            PipelineState::Installing => PipelineState::Restarting,
            PipelineState::Restarting => PipelineState::AwaitingConfirmation,
            PipelineState::AwaitingConfirmation => PipelineState::PersistingWatermark,
            PipelineState::PersistingWatermark | PipelineState::Failed => PipelineState::Idle,
        }
    }

    /// 是否允许从当前状态迁移到 `to`
    pub fn can_transition_to(&self, to: PipelineState) -> bool {
        match to {
            PipelineState::Failed => !matches!(self, PipelineState::Idle | PipelineState::Failed),
            _ => self.next() == to,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 部署运行结果状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Running,
    Success,
    Failed,
}

impl DeployStatus {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStatus::Running => "running",
            DeployStatus::Success => "success",
            DeployStatus::Failed => "failed",
        }
    }
}

/// 阶段状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// 部署阶段信息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployStage {
    /// 阶段标识 (e.g., "update_source", "copy", "restart")
    pub name: String,
    /// 显示名称
    pub display_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub status: StageStatus,
    /// 附加信息
    pub message: Option<String>,
}

impl DeployStage {
    /// 创建新的待执行阶段
    pub fn new(name: &str, display_name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Pending,
            message: None,
        }
    }

    /// 流水线的标准阶段列表
    pub fn pipeline_stages() -> Vec<DeployStage> {
        vec![
            DeployStage::new("update_source", "Update Source"),
            DeployStage::new("map_changes", "Map Changes"),
            DeployStage::new("resolve_graph", "Resolve Graph"),
            DeployStage::new("copy", "Copy"),
            DeployStage::new("install", "Install"),
            DeployStage::new("restart", "Restart"),
            DeployStage::new("await_confirmation", "Await Confirmation"),
            DeployStage::new("persist_watermark", "Persist Watermark"),
        ]
    }

    /// 开始执行阶段
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    /// 完成阶段
    pub fn finish(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    /// 跳过阶段
    pub fn skip(&mut self, reason: Option<String>) {
        self.status = StageStatus::Skipped;
        self.message = reason;
    }
}
