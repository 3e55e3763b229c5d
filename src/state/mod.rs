//! 运行时状态模块
//!
//! 应用状态、单次运行状态和运行历史

pub mod app_state;
pub mod run_history;
pub mod run_state;

pub use app_state::AppState;
pub use run_history::RunHistory;
pub use run_state::{RunSnapshot, RunState};
