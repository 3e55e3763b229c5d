//! 运行历史
//!
//! 保存最近完成的运行报告（最新在前），超出上限时丢弃最旧的

use std::collections::VecDeque;
use tokio::sync::RwLock;

use crate::config::env::constants::MAX_RUN_HISTORY;
use crate::domain::report::RunReport;

/// 运行历史
pub struct RunHistory {
    reports: RwLock<VecDeque<RunReport>>,
    max_history: usize,
}

impl Default for RunHistory {
    fn default() -> Self {
        Self::new(MAX_RUN_HISTORY)
    }
}

impl RunHistory {
    pub fn new(max_history: usize) -> Self {
        Self {
            reports: RwLock::new(VecDeque::new()),
            max_history: max_history.max(1),
        }
    }

    /// 添加已完成的运行
    pub async fn push(&self, report: RunReport) {
        let mut reports = self.reports.write().await;
        reports.push_front(report);

        while reports.len() > self.max_history {
            reports.pop_back();
        }
    }

    pub async fn get(&self, run_id: &str) -> Option<RunReport> {
        let reports = self.reports.read().await;
        reports.iter().find(|r| r.run_id == run_id).cloned()
    }

    /// 最近的运行（最新在前）
    pub async fn recent(&self, limit: usize) -> Vec<RunReport> {
        let reports = self.reports.read().await;
        reports.iter().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.reports.read().await.len()
    }

    pub async fn last(&self) -> Option<RunReport> {
        self.reports.read().await.front().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: &str) -> RunReport {
        RunReport::new(id, "refs/heads/production", "alice")
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_newest_first() {
        let history = RunHistory::new(2);
        history.push(report("r1")).await;
        history.push(report("r2")).await;
        history.push(report("r3")).await;

        assert_eq!(history.len().await, 2);
        let ids: Vec<String> = history.recent(10).await.into_iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec!["r3", "r2"]);
        assert!(history.get("r1").await.is_none());
        assert_eq!(history.last().await.map(|r| r.run_id).as_deref(), Some("r3"));
    }

    #[tokio::test]
    async fn test_recent_respects_limit() {
        let history = RunHistory::default();
        for i in 0..5 {
            history.push(report(&format!("r{}", i))).await;
        }
        assert_eq!(history.recent(3).await.len(), 3);
        assert!(history.get("r0").await.is_some());
    }
}
