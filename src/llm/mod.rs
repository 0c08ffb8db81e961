//! LLM 层：客户端抽象与实现（外部规划进程 / Mock）

pub mod command;
pub mod mock;
pub mod traits;

pub use command::CommandLlmClient;
pub use mock::MockLlmClient;
pub use traits::{LlmClient, Message, Role, TokenStream};
