//! 运行上下文
//!
//! 单次流水线运行的执行上下文：运行状态、报告、当前阶段

use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::domain::deploy::{DeployStatus, PipelineState, StageStatus};
use crate::domain::report::{RestartNotConfirmed, RunReport};
use crate::error::DeployError;
use crate::state::run_state::RunState;

/// 运行上下文
pub struct RunContext {
    pub run: Arc<RunState>,
    pub report: RunReport,
    /// 当前阶段名（对应 `DeployStage::name`）
    current_stage: Option<&'static str>,
}

impl RunContext {
    pub fn new(run: Arc<RunState>) -> Self {
        let mut report = RunReport::new(
            run.run_id.clone(),
            run.trigger.git_ref.clone(),
            run.trigger.pusher_name.clone(),
        );
        report.started_at = run.started_at;
        Self {
            run,
            report,
            current_stage: None,
        }
    }

    /// 进入下一个流水线状态并开始对应阶段
    pub async fn enter(&mut self, state: PipelineState, stage: &'static str) -> Result<(), DeployError> {
        self.ensure_active()?;

        let from = self.run.phase().await;
        if !from.can_transition_to(state) {
            warn!(run_id = %self.run.run_id, from = %from, to = %state, "Unexpected pipeline transition");
        }
        self.run.set_phase(state).await;
        info!(run_id = %self.run.run_id, state = %state, "Pipeline state");

        if let Some(s) = self.report.stage_mut(stage) {
            s.start();
        }
        self.current_stage = Some(stage);
        Ok(())
    }

    /// 当前阶段成功
    pub fn complete_stage(&mut self, message: impl Into<String>) {
        if let Some(name) = self.current_stage.take() {
            if let Some(stage) = self.report.stage_mut(name) {
                stage.finish(true, Some(message.into()));
            }
        }
    }

    /// 运行已被取消则返回错误
    pub fn ensure_active(&self) -> Result<(), DeployError> {
        if self.run.cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        Ok(())
    }

    /// 结束运行，生成报告
    pub async fn finish(mut self, outcome: Result<(), DeployError>) -> RunReport {
        let phase = self.run.phase().await;

        match outcome {
            Ok(()) => {
                self.report.status = DeployStatus::Success;
                self.report.final_state = phase;
            }
            Err(e) => {
                if e.is_resolution_error() {
                    error!(run_id = %self.run.run_id, error = %e, "Graph resolution failed");
                } else {
                    error!(run_id = %self.run.run_id, state = %phase, error = %e, "Deployment run failed");
                }

                if let Some(name) = self.current_stage.take() {
                    if let Some(stage) = self.report.stage_mut(name) {
                        stage.finish(false, Some(e.to_string()));
                    }
                }
                for stage in &mut self.report.stages {
                    if stage.status == StageStatus::Pending {
                        stage.skip(Some(format!("run failed in {}", phase)));
                    }
                }

                self.run.set_phase(PipelineState::Failed).await;
                self.report.status = DeployStatus::Failed;
                self.report.final_state = PipelineState::Failed;
                self.report.failed_in = Some(phase);
                self.report.error_kind = Some(e.kind());
                self.report.error = Some(e.to_string());

                if self.report.pending_confirmations.is_empty() {
                    self.report.pending_confirmations = self
                        .run
                        .pending_confirmations()
                        .into_iter()
                        .map(|module| RestartNotConfirmed { module })
                        .collect();
                }
            }
        }

        self.report.failures = self.run.failed_commands().await;
        self.report.finished_at = Some(Utc::now());
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trigger::Trigger;
    use tokio_util::sync::CancellationToken;

    fn context() -> RunContext {
        RunContext::new(Arc::new(RunState::new(
            "run-1",
            Trigger::new("refs/heads/production", "alice", vec![]),
            CancellationToken::new(),
        )))
    }

    #[tokio::test]
    async fn test_failure_marks_stage_and_skips_rest() {
        let mut ctx = context();
        ctx.enter(PipelineState::UpdatingSource, "update_source").await.unwrap();
        ctx.complete_stage("updated");
        ctx.enter(PipelineState::MappingChanges, "map_changes").await.unwrap();

        let report = ctx
            .finish(Err(DeployError::SourceUpdate("boom".to_string())))
            .await;

        assert_eq!(report.status, DeployStatus::Failed);
        assert_eq!(report.failed_in, Some(PipelineState::MappingChanges));
        assert_eq!(report.error_kind, Some("source_update"));
        assert_eq!(report.stages[0].status, StageStatus::Success);
        assert_eq!(report.stages[1].status, StageStatus::Failed);
        assert!(report.stages[2..].iter().all(|s| s.status == StageStatus::Skipped));
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_enter_after_cancel_fails() {
        let mut ctx = context();
        ctx.run.cancel.cancel();
        assert!(matches!(
            ctx.enter(PipelineState::UpdatingSource, "update_source").await,
            Err(DeployError::Cancelled)
        ));
    }
}
