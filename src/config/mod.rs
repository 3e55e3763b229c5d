//! 配置模块
//!
//! 环境变量解析与模块清单加载

pub mod env;
pub mod manifest;

pub use env::{EnvConfig, ExecutionConfig, TemplateConfig};
pub use manifest::{load_registry, parse_registry, ManifestError};
