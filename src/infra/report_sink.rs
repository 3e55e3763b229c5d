//! 运行报告投递
//!
//! 报告总是写入日志；配置了回调 URL 时再 POST 给外部通知服务

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::domain::report::RunReport;

const NOTIFY_ATTEMPTS: u32 = 3;
const NOTIFY_RETRY_DELAY: Duration = Duration::from_secs(2);

/// 报告接收方
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn send_report(&self, report: &RunReport) -> anyhow::Result<()>;
}

#[async_trait]
impl<T: ReportSink + ?Sized> ReportSink for std::sync::Arc<T> {
    async fn send_report(&self, report: &RunReport) -> anyhow::Result<()> {
        (**self).send_report(report).await
    }
}

/// 只写日志
#[derive(Clone, Debug, Default)]
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    async fn send_report(&self, report: &RunReport) -> anyhow::Result<()> {
        if report.is_success() {
            info!(
                run_id = %report.run_id,
                git_ref = %report.git_ref,
                pusher = %report.pusher,
                revision = ?report.revision,
                modules = report.actions_taken.len(),
                commands = report.commands_executed.len(),
                pending = ?report.pending_modules(),
                "Deployment succeeded"
            );
        } else {
            error!(
                run_id = %report.run_id,
                git_ref = %report.git_ref,
                pusher = %report.pusher,
                failed_in = ?report.failed_in,
                error = ?report.error,
                failures = report.failures.len(),
                "Deployment failed"
            );
            for failure in &report.failures {
                warn!(
                    run_id = %report.run_id,
                    module = %failure.module,
                    location = %failure.location,
                    action = %failure.action,
                    attempts = failure.attempts,
                    reason = %failure.reason,
                    "Command failure"
                );
            }
        }
        Ok(())
    }
}

/// HTTP 回调，带重试，复用连接池
#[derive(Clone)]
pub struct CallbackReportSink {
    client: Client,
    url: String,
}

impl CallbackReportSink {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(2)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ReportSink for CallbackReportSink {
    async fn send_report(&self, report: &RunReport) -> anyhow::Result<()> {
        let mut last_error = None;

        for attempt in 1..=NOTIFY_ATTEMPTS {
            match self
                .client
                .post(&self.url)
                .timeout(Duration::from_secs(10))
                .json(report)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    info!(
                        run_id = %report.run_id,
                        status = %report.status.as_str(),
                        attempt = attempt,
                        "Delivered run report"
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    warn!(
                        run_id = %report.run_id,
                        status = %resp.status(),
                        attempt = attempt,
                        "Report callback returned non-success status"
                    );
                    last_error = Some(anyhow::anyhow!("callback returned {}", resp.status()));
                }
                Err(e) => {
                    warn!(
                        run_id = %report.run_id,
                        error = %e,
                        attempt = attempt,
                        "Failed to deliver run report, will retry"
                    );
                    last_error = Some(e.into());
                }
            }

            if attempt < NOTIFY_ATTEMPTS {
                tokio::time::sleep(NOTIFY_RETRY_DELAY).await;
            }
        }

        error!(
            run_id = %report.run_id,
            url = %self.url,
            "Failed to deliver run report after {} attempts", NOTIFY_ATTEMPTS
        );
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("report delivery failed")))
    }
}

/// 依次投递给多个接收方，单个失败不影响其他
pub struct FanoutReportSink {
    sinks: Vec<Box<dyn ReportSink>>,
}

impl FanoutReportSink {
    pub fn new(sinks: Vec<Box<dyn ReportSink>>) -> Self {
        Self { sinks }
    }

    /// 日志 + 可选回调
    pub fn from_callback(callback_url: Option<&str>) -> anyhow::Result<Self> {
        let mut sinks: Vec<Box<dyn ReportSink>> = vec![Box::new(LogReportSink)];
        if let Some(url) = callback_url {
            sinks.push(Box::new(CallbackReportSink::new(url)?));
        }
        Ok(Self::new(sinks))
    }

    /// 接收方数量
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

#[async_trait]
impl ReportSink for FanoutReportSink {
    async fn send_report(&self, report: &RunReport) -> anyhow::Result<()> {
        let mut failed = 0;
        for sink in &self.sinks {
            if let Err(e) = sink.send_report(report).await {
                warn!(run_id = %report.run_id, error = %e, "Report sink failed");
                failed += 1;
            }
        }
        if failed > 0 {
            anyhow::bail!("{} of {} report sink(s) failed", failed, self.sinks.len());
        }
        Ok(())
    }
}
