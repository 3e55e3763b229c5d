//! 水位线持久化
//!
//! 记录最后一次成功部署的 revision，下次运行据此计算 diff

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, warn};

use super::source::is_revision;

/// 水位线存储
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// 读取上次部署的 revision，不存在返回 None
    async fn read_last_revision(&self) -> Option<String>;

    /// 写入本次部署的 revision
    async fn write_last_revision(&self, revision: &str) -> anyhow::Result<()>;
}

/// 水位线文件内容
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatermarkFile {
    pub commit: String,
    pub saved_at: DateTime<Utc>,
}

/// 基于 JSON 文件的水位线存储
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn read_last_revision(&self) -> Option<String> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                info!(
                    path = %self.path.display(),
                    error = %e,
                    "No watermark found, every module will be deployed"
                );
                return None;
            }
        };

        match serde_json::from_str::<WatermarkFile>(&content) {
            Ok(file) if is_revision(file.commit.trim()) => {
                let commit = file.commit.trim().to_string();
                info!(commit = %commit, saved_at = %file.saved_at, "Last deployed revision");
                Some(commit)
            }
            Ok(file) => {
                if !file.commit.trim().is_empty() {
                    warn!(
                        path = %self.path.display(),
                        commit = %file.commit,
                        "Watermark is not a git revision, ignoring"
                    );
                }
                None
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to parse watermark file, ignoring"
                );
                None
            }
        }
    }

    /// 原子写入：先写临时文件再重命名
    async fn write_last_revision(&self, revision: &str) -> anyhow::Result<()> {
        let temp_path = self.path.with_extension("json.tmp");

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let content = serde_json::to_string_pretty(&WatermarkFile {
            commit: revision.to_string(),
            saved_at: Utc::now(),
        })?;

        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &self.path).await?;

        info!(path = %self.path.display(), commit = %revision, "Saved watermark");
        Ok(())
    }
}
