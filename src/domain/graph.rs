//! 依赖图解析结果模型

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::module::ModuleKind;

/// 模块动作
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Copy,
    Install,
    Restart,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Copy => "copy",
            Action::Install => "install",
            Action::Restart => "restart",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 动作集合，只增不减
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionSet(BTreeSet<Action>);

impl ActionSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// copy + install
    pub fn copy_install() -> Self {
        Self::from_iter([Action::Copy, Action::Install])
    }

    /// copy + install + restart
    pub fn full() -> Self {
        Self::from_iter([Action::Copy, Action::Install, Action::Restart])
    }

    pub fn restart_only() -> Self {
        Self::from_iter([Action::Restart])
    }

    pub fn contains(&self, action: Action) -> bool {
        self.0.contains(&action)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 并集，返回是否有新增动作
    pub fn widen(&mut self, other: &ActionSet) -> bool {
        let before = self.0.len();
        self.0.extend(other.0.iter().copied());
        self.0.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = Action> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Action> for ActionSet {
    fn from_iter<T: IntoIterator<Item = Action>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ActionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(Action::as_str).collect();
        write!(f, "{{{}}}", names.join(","))
    }
}

/// 单次部署中某个模块的解析结果
///
/// 解析期间只会被拓宽（actions 并集、runtime_depends_on 增长），
/// 解析完成后冻结，随运行结束丢弃。
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActionNode {
    /// 模块名称
    pub module: String,
    /// 模块类型
    pub kind: ModuleKind,
    /// 需要执行的动作
    pub actions: ActionSet,
    /// 本节点重启前必须先发出重启指令的 server 模块
    pub runtime_depends_on: BTreeSet<String>,
    /// 沿 runtime_depends_on 边的最长链长度
    pub depth: usize,
}

impl ActionNode {
    pub fn new(module: impl Into<String>, kind: ModuleKind, actions: ActionSet) -> Self {
        Self {
            module: module.into(),
            kind,
            actions,
            runtime_depends_on: BTreeSet::new(),
            depth: 0,
        }
    }

    pub fn requires(&self, action: Action) -> bool {
        self.actions.contains(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widen_reports_growth() {
        let mut set = ActionSet::restart_only();
        assert!(set.widen(&ActionSet::copy_install()));
        assert_eq!(set, ActionSet::full());
        assert!(!set.widen(&ActionSet::copy_install()));
    }

    #[test]
    fn test_action_set_display() {
        assert_eq!(ActionSet::full().to_string(), "{copy,install,restart}");
        assert_eq!(ActionSet::empty().to_string(), "{}");
    }
}
