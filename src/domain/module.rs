//! 模块注册表
//!
//! 描述每个可部署模块及其声明的依赖，进程生命周期内只读。

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;

use crate::error::DeployError;

use super::graph::Action;

/// 模块类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// 有运行进程，需要重启
    Server,
    /// 被复制/安装到依赖方环境中，本身从不重启
    Library,
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Server => "server",
            ModuleKind::Library => "library",
        }
    }
}

/// 依赖强度
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BondStrength {
    /// 依赖变更会强制依赖方执行动作
    Hard,
    /// 不强制任何动作
    Soft,
}

/// 依赖声明
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// 被依赖的模块名称
    #[serde(rename = "name")]
    pub target: String,
    #[serde(rename = "type", default = "default_bond")]
    pub bond: BondStrength,
}

fn default_bond() -> BondStrength {
    BondStrength::Hard
}

impl Dependency {
    pub fn hard(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            bond: BondStrength::Hard,
        }
    }

    pub fn soft(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            bond: BondStrength::Soft,
        }
    }
}

/// 命令模板（按动作索引）
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<String>,
    /// 显式重启命令，未配置时由 stop + start 组合
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
}

impl CommandTemplates {
    /// 获取某个动作的模板
    ///
    /// restart 优先使用显式模板，其次 `stop && start`，再次只有 start。
    pub fn template(&self, action: Action) -> Option<Cow<'_, str>> {
        match action {
            Action::Copy => self.copy.as_deref().map(Cow::Borrowed),
            Action::Install => self.install.as_deref().map(Cow::Borrowed),
            Action::Restart => {
                if let Some(restart) = self.restart.as_deref() {
                    return Some(Cow::Borrowed(restart));
                }
                match (self.stop.as_deref(), self.start.as_deref()) {
                    (Some(stop), Some(start)) => Some(Cow::Owned(format!("{} && {}", stop, start))),
                    (None, Some(start)) => Some(Cow::Borrowed(start)),
                    _ => None,
                }
            }
        }
    }
}

/// 可部署模块
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ModuleKind,
    /// 路径前缀匹配规则（按顺序）
    #[serde(rename = "paths", default)]
    pub path_patterns: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// 部署目标（主机名/路径），library 不需要声明
    #[serde(rename = "location", default)]
    pub locations: Vec<String>,
    /// 仓库内源码路径（`%path%`），缺省为第一条路径规则
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(flatten)]
    pub commands: CommandTemplates,
}

impl Module {
    pub fn new(name: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            name: name.into(),
            kind,
            path_patterns: Vec::new(),
            dependencies: Vec::new(),
            locations: Vec::new(),
            source: None,
            commands: CommandTemplates::default(),
        }
    }

    pub fn server(name: impl Into<String>) -> Self {
        Self::new(name, ModuleKind::Server)
    }

    pub fn library(name: impl Into<String>) -> Self {
        Self::new(name, ModuleKind::Library)
    }

    pub fn with_paths<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_locations<I, S>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locations = locations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_commands(mut self, commands: CommandTemplates) -> Self {
        self.commands = commands;
        self
    }

    pub fn is_server(&self) -> bool {
        self.kind == ModuleKind::Server
    }

    /// `%path%` 的取值
    pub fn source_path(&self) -> &str {
        self.source
            .as_deref()
            .or_else(|| self.path_patterns.first().map(String::as_str))
            .unwrap_or(&self.name)
    }
}

/// 模块注册表
///
/// 保留声明顺序（变更映射按注册顺序首个匹配生效），并预先建立反向依赖索引。
#[derive(Clone, Debug, Default)]
pub struct ModuleRegistry {
    modules: Vec<Module>,
    index: HashMap<String, usize>,
    /// target index -> [(dependent index, bond)]
    dependents: Vec<Vec<(usize, BondStrength)>>,
}

impl ModuleRegistry {
    /// 构建注册表（不做校验，见 [`ModuleRegistry::validate`]）
    pub fn new(modules: Vec<Module>) -> Self {
        let mut index = HashMap::with_capacity(modules.len());
        for (i, module) in modules.iter().enumerate() {
            index.entry(module.name.clone()).or_insert(i);
        }

        let mut dependents = vec![Vec::new(); modules.len()];
        for (i, module) in modules.iter().enumerate() {
            for dep in &module.dependencies {
                if let Some(&target) = index.get(&dep.target) {
                    dependents[target].push((i, dep.bond));
                }
            }
        }

        Self {
            modules,
            index,
            dependents,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.index.get(name).map(|&i| &self.modules[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// 按注册顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|m| m.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// 依赖 `name` 的模块及其依赖强度（按注册顺序）
    pub fn dependents_of(&self, name: &str) -> Vec<(&Module, BondStrength)> {
        match self.index.get(name) {
            Some(&i) => self.dependents[i]
                .iter()
                .map(|&(d, bond)| (&self.modules[d], bond))
                .collect(),
            None => Vec::new(),
        }
    }

    /// 校验所有依赖名称存在且依赖图无环
    pub fn validate(&self) -> Result<(), DeployError> {
        for module in &self.modules {
            for dep in &module.dependencies {
                if !self.contains(&dep.target) {
                    return Err(DeployError::UnknownModule {
                        name: dep.target.clone(),
                        referenced_by: module.name.clone(),
                    });
                }
            }
        }
        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), DeployError> {
        let mut marks = vec![Mark::Unvisited; self.modules.len()];
        let mut path = Vec::new();
        for start in 0..self.modules.len() {
            if marks[start] == Mark::Unvisited {
                self.visit(start, &mut marks, &mut path)?;
            }
        }
        Ok(())
    }

    fn visit(&self, idx: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Result<(), DeployError> {
        marks[idx] = Mark::InProgress;
        path.push(idx);

        for dep in &self.modules[idx].dependencies {
            let Some(&next) = self.index.get(&dep.target) else {
                continue;
            };
            match marks[next] {
                Mark::InProgress => {
                    let start = path.iter().position(|&i| i == next).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..]
                        .iter()
                        .map(|&i| self.modules[i].name.clone())
                        .collect();
                    cycle.push(self.modules[next].name.clone());
                    return Err(DeployError::DependencyCycle { cycle });
                }
                Mark::Unvisited => self.visit(next, marks, path)?,
                Mark::Done => {}
            }
        }

        path.pop();
        marks[idx] = Mark::Done;
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}
