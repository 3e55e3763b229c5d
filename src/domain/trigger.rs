//! 部署触发事件
//!
//! GitHub push 负载解析与授权判断（仓库名 + 生产分支 + 推送者白名单）

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// 已授权的部署触发
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub pusher_name: String,
    pub changed_paths: Vec<String>,
}

impl Trigger {
    pub fn new(git_ref: impl Into<String>, pusher_name: impl Into<String>, changed_paths: Vec<String>) -> Self {
        Self {
            git_ref: git_ref.into(),
            pusher_name: pusher_name.into(),
            changed_paths,
        }
    }

    /// 启动时的合成触发（无变更路径，依赖水位线 diff）
    pub fn startup() -> Self {
        Self::new("startup", "hook-deployer", Vec::new())
    }

    /// 合并一个后到的触发
    ///
    /// 变更路径取并集，ref/推送者取最新值。
    pub fn coalesce(&mut self, newer: Trigger) {
        let mut paths: BTreeSet<String> = self.changed_paths.drain(..).collect();
        paths.extend(newer.changed_paths);
        self.changed_paths = paths.into_iter().collect();
        self.git_ref = newer.git_ref;
        self.pusher_name = newer.pusher_name;
    }
}

/// GitHub push webhook 负载（只取用到的字段）
#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    pub repository: Option<Repository>,
    pub pusher: Option<Pusher>,
    #[serde(default)]
    pub commits: Vec<Commit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pusher {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Commit {
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

impl PushPayload {
    /// 所有提交中增/改/删路径的去重并集
    pub fn changed_paths(&self) -> Vec<String> {
        let paths: BTreeSet<&String> = self
            .commits
            .iter()
            .flat_map(|c| c.added.iter().chain(&c.modified).chain(&c.removed))
            .collect();
        paths.into_iter().cloned().collect()
    }

    pub fn pusher_name(&self) -> &str {
        self.pusher.as_ref().map_or("", |p| p.name.as_str())
    }
}

/// 触发被拒绝的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// 不是来自配置的仓库
    ForeignRepository(String),
    /// 不是生产分支
    NotProductionBranch(String),
    /// 推送者不在白名单中
    UnauthorizedPusher(String),
}

impl Rejection {
    pub fn message(&self) -> String {
        match self {
            Rejection::ForeignRepository(name) => format!("push is not from the configured repository ({})", name),
            Rejection::NotProductionBranch(r) => format!("{} is not the production branch", r),
            Rejection::UnauthorizedPusher(p) => format!("pusher '{}' is not authorized", p),
        }
    }
}

/// 仓库授权策略
#[derive(Clone, Debug, Default)]
pub struct RepoPolicy {
    /// 仓库名（不区分大小写），None 表示不校验
    pub repository: Option<String>,
    /// 生产分支名
    pub branch: String,
    /// 推送者白名单，空表示所有人
    pub authorized_users: Vec<String>,
}

impl RepoPolicy {
    /// 校验 push 负载，通过则生成触发
    pub fn authorize(&self, payload: &PushPayload) -> Result<Trigger, Rejection> {
        if let Some(ref expected) = self.repository {
            let name = payload.repository.as_ref().map(|r| r.name.as_str()).unwrap_or("");
            if !name.eq_ignore_ascii_case(expected) {
                return Err(Rejection::ForeignRepository(name.to_string()));
            }
        }

        if !self.is_production_ref(&payload.git_ref) {
            return Err(Rejection::NotProductionBranch(payload.git_ref.clone()));
        }

        let pusher = payload.pusher_name();
        if !self.authorized_users.is_empty() && !self.authorized_users.iter().any(|u| u == pusher) {
            return Err(Rejection::UnauthorizedPusher(pusher.to_string()));
        }

        Ok(Trigger::new(
            payload.git_ref.clone(),
            pusher,
            payload.changed_paths(),
        ))
    }

    fn is_production_ref(&self, git_ref: &str) -> bool {
        let branch = git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref);
        branch == self.branch
    }
}
