//! 工具层：注册表、schema 校验、分派器与内置工具

pub mod dispatcher;
pub mod echo;
pub mod fetch;
pub mod memory_read;
pub mod registry;
pub mod schema;
pub mod script;

pub use dispatcher::{ToolCall, ToolDispatcher};
pub use echo::EchoTool;
pub use fetch::FetchDocumentTool;
pub use memory_read::MemoryReadTool;
pub use registry::{
    capability, RegisteredTool, RegistryLease, Tool, ToolContext, ToolDescriptor, ToolHandler,
    ToolInfo, ToolRegistry,
};
pub use schema::CompiledSchema;
pub use script::{run_script_descriptor, script_descriptor, ResolvedScript, ScriptTemplate};
