//! 模块清单加载
//!
//! 清单格式为 `{"modules": [...]}`，数组保证注册顺序。

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::domain::graph::Action;
use crate::domain::module::{Module, ModuleKind, ModuleRegistry};
use crate::error::DeployError;

/// 清单错误
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("module '{0}' is declared more than once")]
    DuplicateModule(String),

    #[error("{kind} module '{module}' declares no location")]
    MissingLocation { module: String, kind: &'static str },

    #[error("server module '{0}' has neither a restart nor a start command")]
    MissingRestartCommand(String),

    #[error(transparent)]
    Registry(#[from] DeployError),
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    modules: Vec<Module>,
}

/// 从文件加载并校验
pub fn load_registry(path: &Path) -> Result<ModuleRegistry, ManifestError> {
    let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let registry = parse_registry(&content)?;

    info!(
        path = %path.display(),
        modules = registry.len(),
        "Loaded module manifest"
    );
    Ok(registry)
}

/// 解析清单文本并校验
pub fn parse_registry(content: &str) -> Result<ModuleRegistry, ManifestError> {
    let manifest: ManifestFile = serde_json::from_str(content)?;

    let mut seen = HashSet::new();
    for module in &manifest.modules {
        if !seen.insert(module.name.as_str()) {
            return Err(ManifestError::DuplicateModule(module.name.clone()));
        }
        if module.kind != ModuleKind::Library && module.locations.is_empty() {
            return Err(ManifestError::MissingLocation {
                module: module.name.clone(),
                kind: module.kind.as_str(),
            });
        }
        if module.kind == ModuleKind::Server && module.commands.template(Action::Restart).is_none() {
            return Err(ManifestError::MissingRestartCommand(module.name.clone()));
        }
    }

    let registry = ModuleRegistry::new(manifest.modules);
    registry.validate()?;
    Ok(registry)
}
