//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod deploy;
pub mod graph;
pub mod module;
pub mod report;
pub mod trigger;

// Re-exports for convenience
pub use deploy::{DeployStage, DeployStatus, PipelineState, StageStatus};
pub use graph::{Action, ActionNode, ActionSet};
pub use module::{BondStrength, CommandTemplates, Dependency, Module, ModuleKind, ModuleRegistry};
pub use report::{CommandFailure, NodeSummary, PlannedCommand, RestartNotConfirmed, RunReport};
pub use trigger::{PushPayload, RepoPolicy, Trigger};
