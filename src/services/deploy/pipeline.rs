//! 部署流水线
//!
//! IDLE → UPDATING_SOURCE → MAPPING_CHANGES → RESOLVING_GRAPH → COPYING →
//! INSTALLING → RESTARTING → AWAITING_CONFIRMATION → PERSISTING_WATERMARK → IDLE，
//! 任一活动状态出现不可恢复错误进入 FAILED。无论成败都投递一份报告。

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{ExecutionConfig, TemplateConfig};
use crate::domain::deploy::PipelineState;
use crate::domain::graph::{Action, ActionNode};
use crate::domain::module::ModuleRegistry;
use crate::domain::report::{NodeSummary, RunReport};
use crate::error::DeployError;
use crate::infra::command::CommandExecutor;
use crate::infra::report_sink::ReportSink;
use crate::infra::source::SourceControl;
use crate::infra::watermark::WatermarkStore;
use crate::services::command_builder::CommandBuilder;
use crate::services::mapper::ChangeMapper;
use crate::services::resolver::GraphResolver;
use crate::state::run_state::RunState;

use super::context::RunContext;
use super::restart::RestartCoordinator;
use super::stage::StageExecutor;

/// 流水线依赖的外部能力
pub struct PipelineDeps {
    pub executor: Arc<dyn CommandExecutor>,
    pub source: Arc<dyn SourceControl>,
    pub watermark: Arc<dyn WatermarkStore>,
    pub sink: Arc<dyn ReportSink>,
}

/// 部署流水线
pub struct Pipeline {
    registry: Arc<ModuleRegistry>,
    source: Arc<dyn SourceControl>,
    watermark: Arc<dyn WatermarkStore>,
    sink: Arc<dyn ReportSink>,
    mapper: ChangeMapper,
    resolver: GraphResolver,
    builder: Arc<CommandBuilder>,
    stage: Arc<StageExecutor>,
    restart: RestartCoordinator,
}

impl Pipeline {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        deps: PipelineDeps,
        settings: ExecutionConfig,
        templates: TemplateConfig,
    ) -> Self {
        let confirm_timeout = settings.confirm_timeout;
        let builder = Arc::new(CommandBuilder::new(registry.clone(), templates));
        let stage = Arc::new(StageExecutor::new(deps.executor, settings));
        let restart = RestartCoordinator::new(stage.clone(), builder.clone(), confirm_timeout);

        Self {
            mapper: ChangeMapper::new(registry.clone()),
            resolver: GraphResolver::new(registry.clone()),
            registry,
            source: deps.source,
            watermark: deps.watermark,
            sink: deps.sink,
            builder,
            stage,
            restart,
        }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// 执行一次完整运行并投递报告
    pub async fn run(&self, run: Arc<RunState>) -> RunReport {
        info!(
            run_id = %run.run_id,
            git_ref = %run.trigger.git_ref,
            pusher = %run.trigger.pusher_name,
            paths = run.trigger.changed_paths.len(),
            "Starting deployment run"
        );

        let mut ctx = RunContext::new(run.clone());
        let outcome = self.execute(&mut ctx).await;
        let report = ctx.finish(outcome).await;

        if let Err(e) = self.sink.send_report(&report).await {
            warn!(run_id = %run.run_id, error = %e, "Failed to deliver run report");
        }

        run.set_phase(PipelineState::Idle).await;
        report
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<(), DeployError> {
        let run = ctx.run.clone();

        // 更新源码
        ctx.enter(PipelineState::UpdatingSource, "update_source").await?;
        self.source.update(&run.cancel).await?;
        let head = self.source.head_revision(&run.cancel).await?;
        let previous = self.watermark.read_last_revision().await;
        ctx.report.revision = Some(head.clone());
        ctx.report.previous_revision = previous.clone();
        ctx.complete_stage(format!("at {}", head));

        // 映射变更
        ctx.enter(PipelineState::MappingChanges, "map_changes").await?;
        let mut paths = run.trigger.changed_paths.clone();
        if let Some(ref previous) = previous {
            if previous != &head {
                paths.extend(self.source.changed_since(previous, &run.cancel).await?);
            }
        }
        let changed = self.mapper.map(&paths, previous.as_deref());
        ctx.report.changed_modules = changed.iter().cloned().collect();
        info!(
            run_id = %run.run_id,
            paths = paths.len(),
            modules = ?ctx.report.changed_modules,
            full = previous.is_none(),
            "Mapped changes"
        );
        ctx.complete_stage(format!("{} module(s) changed", changed.len()));

        // 解析依赖图
        ctx.enter(PipelineState::ResolvingGraph, "resolve_graph").await?;
        let nodes = self.resolver.resolve(&changed)?;
        ctx.report.actions_taken = nodes.iter().map(NodeSummary::from).collect();
        for node in &nodes {
            info!(
                run_id = %run.run_id,
                module = %node.module,
                actions = %node.actions,
                depth = node.depth,
                "Planned module"
            );
        }
        ctx.complete_stage(format!("{} module(s) affected", nodes.len()));

        // copy / install
        self.run_stage(ctx, &nodes, Action::Copy, PipelineState::Copying, "copy").await?;
        self.run_stage(ctx, &nodes, Action::Install, PipelineState::Installing, "install").await?;

        // 重启
        ctx.enter(PipelineState::Restarting, "restart").await?;
        let restart = self.restart.run_restart(&nodes, run.clone()).await?;
        ctx.report
            .commands_executed
            .extend(restart.succeeded.iter().map(|c| c.command.clone()));
        ctx.report
            .commands_executed
            .extend(restart.failed.iter().map(|f| f.command.clone()));
        if !restart.is_success() {
            return Err(DeployError::RetryBudgetExhausted {
                action: Action::Restart,
                failures: restart.failed.len(),
                attempts: restart.attempts,
            });
        }
        ctx.complete_stage(format!("{} service(s) restarted", restart.issued.len()));

        // 等待确认
        ctx.enter(PipelineState::AwaitingConfirmation, "await_confirmation").await?;
        let pending = self.restart.await_confirmations(&run).await;
        ctx.ensure_active()?;
        let message = if pending.is_empty() {
            "all restarts confirmed".to_string()
        } else {
            format!("{} restart(s) not confirmed", pending.len())
        };
        ctx.report.pending_confirmations = pending;
        ctx.complete_stage(message);

        // 持久化水位线
        ctx.enter(PipelineState::PersistingWatermark, "persist_watermark").await?;
        self.watermark
            .write_last_revision(&head)
            .await
            .map_err(|e| DeployError::Watermark(e.to_string()))?;
        ctx.complete_stage(format!("watermark at {}", head));

        Ok(())
    }

    async fn run_stage(
        &self,
        ctx: &mut RunContext,
        nodes: &[ActionNode],
        action: Action,
        state: PipelineState,
        stage_name: &'static str,
    ) -> Result<(), DeployError> {
        ctx.enter(state, stage_name).await?;

        let planned = self.builder.plan(nodes, action);
        let total = planned.len();
        let result = self.stage.run_stage(planned, action, &ctx.run).await?;

        ctx.report
            .commands_executed
            .extend(result.succeeded.iter().map(|c| c.command.clone()));
        ctx.report
            .commands_executed
            .extend(result.failed.iter().map(|f| f.command.clone()));

        if !result.is_success() {
            return Err(DeployError::RetryBudgetExhausted {
                action,
                failures: result.failed.len(),
                attempts: result.attempts,
            });
        }
        ctx.complete_stage(format!("{} command(s)", total));
        Ok(())
    }
}
