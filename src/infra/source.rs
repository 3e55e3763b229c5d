//! 源码仓库操作
//!
//! 更新工作区、读取当前 revision、计算自上次部署以来的变更文件

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::DeployError;

use super::command::{CommandError, CommandExecutor};

const HEAD_REVISION_COMMAND: &str = "git log --pretty=format:%H -n 1";
const DIFF_COMMAND: &str = "git diff --name-only %hash%";

/// 是否为 git revision（4 到 64 位十六进制）
///
/// revision 来自水位线文件，拼进 shell 命令前必须校验。
pub fn is_revision(value: &str) -> bool {
    (4..=64).contains(&value.len()) && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// 源码仓库能力
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// 拉取最新代码
    async fn update(&self, cancel: &CancellationToken) -> Result<(), DeployError>;

    /// 当前 HEAD revision
    async fn head_revision(&self, cancel: &CancellationToken) -> Result<String, DeployError>;

    /// 自 `revision` 以来变更的文件路径
    async fn changed_since(&self, revision: &str, cancel: &CancellationToken) -> Result<Vec<String>, DeployError>;
}

/// 基于 git 命令行的实现，命令经由注入的执行器运行
pub struct GitSource {
    executor: Arc<dyn CommandExecutor>,
    update_command: String,
    timeout: Duration,
}

impl GitSource {
    pub fn new(executor: Arc<dyn CommandExecutor>, update_command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            executor,
            update_command: update_command.into(),
            timeout,
        }
    }

    async fn run(&self, command: &str, cancel: &CancellationToken) -> Result<String, DeployError> {
        let output = self
            .executor
            .execute(command, self.timeout, cancel)
            .await
            .map_err(|e| match e {
                CommandError::Cancelled => DeployError::Cancelled,
                other => DeployError::SourceUpdate(format!("{}: {}", command, other)),
            })?;

        if output.success() {
            Ok(output.stdout)
        } else {
            Err(DeployError::SourceUpdate(format!(
                "{}: {}",
                command,
                output.failure_reason(256)
            )))
        }
    }
}

#[async_trait]
impl SourceControl for GitSource {
    async fn update(&self, cancel: &CancellationToken) -> Result<(), DeployError> {
        self.run(&self.update_command, cancel).await.map(|_| ())
    }

    async fn head_revision(&self, cancel: &CancellationToken) -> Result<String, DeployError> {
        let out = self.run(HEAD_REVISION_COMMAND, cancel).await?;
        let revision = out.trim().trim_matches('\'').to_string();
        if revision.is_empty() {
            return Err(DeployError::SourceUpdate("repository has no commits".to_string()));
        }
        Ok(revision)
    }

    async fn changed_since(&self, revision: &str, cancel: &CancellationToken) -> Result<Vec<String>, DeployError> {
        if !is_revision(revision) {
            return Err(DeployError::Watermark(format!("'{}' is not a git revision", revision)));
        }
        let command = DIFF_COMMAND.replace("%hash%", revision);
        let out = self.run(&command, cancel).await?;
        let mut paths: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::command::ExecOutput;
    use crate::testing::ScriptedExecutor;

    fn source(executor: Arc<ScriptedExecutor>) -> GitSource {
        GitSource::new(executor, "git pull", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_changed_since_parses_diff() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond(
            "git diff --name-only abc123",
            vec![ExecOutput::ok("srv/api/a.js\n\nlib/core/b.js\nsrv/api/a.js\n")],
        );

        let paths = source(executor.clone())
            .changed_since("abc123", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(paths, vec!["lib/core/b.js", "srv/api/a.js"]);
        assert_eq!(executor.calls(), vec!["git diff --name-only abc123"]);
    }

    #[tokio::test]
    async fn test_head_revision_trims_output() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond(HEAD_REVISION_COMMAND, vec![ExecOutput::ok("'deadbeef'\n")]);

        let rev = source(executor).head_revision(&CancellationToken::new()).await.unwrap();
        assert_eq!(rev, "deadbeef");
    }

    #[tokio::test]
    async fn test_update_failure_is_source_error() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond("git pull", vec![ExecOutput::failed(1, "fatal: unable to access remote")]);

        let err = source(executor).update(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DeployError::SourceUpdate(ref m) if m.contains("unable to access")));
    }

    #[tokio::test]
    async fn test_cancelled_update_is_cancellation() {
        let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_secs(10)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = source(executor).update(&cancel).await.unwrap_err();
        assert!(matches!(err, DeployError::Cancelled));
        assert_eq!(err.kind(), "cancelled");
    }

    #[tokio::test]
    async fn test_diff_rejects_non_revision() {
        let executor = Arc::new(ScriptedExecutor::new());
        let err = source(executor.clone())
            .changed_since("HEAD; rm -rf /", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Watermark(_)));
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn test_is_revision() {
        assert!(is_revision("deadbeef"));
        assert!(is_revision("0123456789abcdef0123456789ABCDEF01234567"));
        assert!(!is_revision("abc"));
        assert!(!is_revision("main"));
        assert!(!is_revision("abc123 && reboot"));
        assert!(!is_revision(""));
    }
}
