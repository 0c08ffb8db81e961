//! Hive - Rust 智能体编排核心
//!
//! 推理智能体与编码智能体共享工具注册表、沙箱脚本执行与持久化项目记忆。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、运行状态机、停止信号、步内调度、Supervisor、装配与关闭
//! - **host**: 宿主 JSON 行命令通道
//! - **llm**: LLM 客户端抽象与实现（外部规划进程 / Mock）
//! - **mcp**: MCP 网关（JSON-RPC over stdio / TCP）
//! - **memory**: 项目记忆（版本化键值、历史日志、SQLite、回放）
//! - **observability**: 日志初始化
//! - **react**: Planner、智能体配置、运行主循环
//! - **sandbox**: 沙箱作业与资源限制
//! - **tools**: 工具注册表、Dispatcher 与内置工具

pub mod config;
pub mod core;
pub mod host;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod observability;
pub mod react;
pub mod sandbox;
pub mod tools;

pub use crate::core::{Supervisor, SupervisorBuilder};
