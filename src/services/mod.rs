//! 服务层模块
//!
//! 变更映射、依赖图解析、命令渲染和部署流水线

pub mod command_builder;
pub mod deploy;
pub mod mapper;
pub mod resolver;

pub use command_builder::CommandBuilder;
pub use mapper::ChangeMapper;
pub use resolver::GraphResolver;
