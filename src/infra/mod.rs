//! 基础设施模块
//!
//! 封装外部依赖（命令执行、git、水位线文件、报告回调、确认客户端）

pub mod command;
pub mod confirm_client;
pub mod report_sink;
pub mod source;
pub mod watermark;

pub use command::{CommandError, CommandExecutor, ExecOutput, ShellExecutor};
pub use confirm_client::ConfirmationClient;
pub use report_sink::{CallbackReportSink, FanoutReportSink, LogReportSink, ReportSink};
pub use source::{GitSource, SourceControl};
pub use watermark::{FileWatermarkStore, WatermarkStore};
