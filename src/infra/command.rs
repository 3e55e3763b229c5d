//! 命令执行器
//!
//! 提供统一的命令执行接口，支持：
//! - 超时控制（超时后 kill 子进程）
//! - 取消支持（运行级超时）
//! - stdout/stderr 分离

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 命令执行错误
#[derive(Debug)]
pub enum CommandError {
    /// 命令启动失败
    SpawnFailed(std::io::Error),
    /// 命令被取消
    Cancelled,
    /// 等待命令完成失败
    WaitFailed(std::io::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::SpawnFailed(e) => write!(f, "Failed to spawn command: {}", e),
            CommandError::Cancelled => write!(f, "Command was cancelled"),
            CommandError::WaitFailed(e) => write!(f, "Failed to wait for command: {}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::SpawnFailed(e) | CommandError::WaitFailed(e) => Some(e),
            CommandError::Cancelled => None,
        }
    }
}

/// 命令执行结果
#[derive(Clone, Debug, Default)]
pub struct ExecOutput {
    /// 退出码（被信号终止或超时时为 None）
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// 是否因超时而终止
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn timeout() -> Self {
        Self {
            timed_out: true,
            ..Default::default()
        }
    }

    /// 退出码为 0 且未超时
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// 失败原因摘要
    pub fn failure_reason(&self, max_len: usize) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let stderr = self.stderr.trim();
        let detail = if stderr.is_empty() { self.stdout.trim() } else { stderr };
        let code = self
            .exit_code
            .map_or_else(|| "killed".to_string(), |c| format!("exit code {}", c));
        if detail.is_empty() {
            code
        } else {
            format!("{}: {}", code, tail(detail, max_len))
        }
    }
}

/// 子进程被终止后等待输出的宽限期
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

async fn collect_output(task: tokio::task::JoinHandle<String>, grace: Option<Duration>) -> String {
    match grace {
        None => task.await.unwrap_or_default(),
        Some(grace) => match tokio::time::timeout(grace, task).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => String::new(),
        },
    }
}

/// 取字符串末尾最多 `max_len` 字节（按字符边界）
fn tail(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut start = s.len() - max_len;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// 执行单条 shell 命令的能力
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// 执行命令；非零退出码与超时体现在 `ExecOutput` 中，只有启动失败和取消返回错误
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, CommandError>;
}

/// 基于 `sh -c` 的执行器
#[derive(Clone, Debug)]
pub struct ShellExecutor {
    work_dir: PathBuf,
    path_env: Option<String>,
}

impl ShellExecutor {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            path_env: None,
        }
    }

    pub fn with_path_env(mut self, path_env: Option<String>) -> Self {
        self.path_env = path_env;
        self
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, CommandError> {
        debug!(command = %command, "Executing command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref path) = self.path_env {
            cmd.env("PATH", path);
        }

        let mut child = cmd.spawn().map_err(CommandError::SpawnFailed)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // 启动 stdout/stderr 读取任务
        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut out) = stdout {
                let _ = out.read_to_string(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut err) = stderr {
                let _ = err.read_to_string(&mut buf).await;
            }
            buf
        });

        // 等待命令完成，支持超时和取消
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(command = %command, "Command cancelled, killing process");
                let _ = child.kill().await;
                Err(CommandError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                error!(command = %command, "Command timed out after {:?}", timeout);
                let _ = child.kill().await;
                // 等待进程实际终止
                child.wait().await.map_err(CommandError::WaitFailed)?;
                Ok(None)
            }
            status = child.wait() => {
                let status = status.map_err(CommandError::WaitFailed)?;
                Ok(Some(status))
            }
        };

        // 被 kill 时孙进程可能仍持有管道，只等待一个宽限期
        let grace = match outcome {
            Ok(Some(_)) => None,
            _ => Some(OUTPUT_GRACE),
        };
        let stdout = collect_output(stdout_task, grace).await;
        let stderr = collect_output(stderr_task, grace).await;

        match outcome? {
            Some(status) => Ok(ExecOutput {
                exit_code: status.code(),
                stdout,
                stderr,
                timed_out: false,
            }),
            None => Ok(ExecOutput {
                exit_code: None,
                stdout,
                stderr,
                timed_out: true,
            }),
        }
    }
}
