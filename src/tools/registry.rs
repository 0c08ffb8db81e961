//! 工具注册表
//!
//! 每个工具由 ToolDescriptor 描述：名称、描述、输入 / 输出 schema、能力标签与处理器
//! （本地 Tool、沙箱脚本模板、MCP 远程工具三选一）。注册是唯一的修改操作；
//! 名称重复返回 DuplicateTool，存在运行租约时返回 RegistryLocked。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::ids::{CallId, RunId};
use crate::core::RegistryError;
use crate::memory::ProjectMemory;
use crate::tools::schema::{any_object, CompiledSchema};
use crate::tools::script::ScriptTemplate;

/// 常用能力标签
pub mod capability {
    pub const NETWORK: &str = "network";
    pub const FILESYSTEM: &str = "filesystem";
    pub const PROCESS_SPAWN: &str = "process-spawn";
    pub const ANALYSIS: &str = "analysis";
    pub const REMOTE: &str = "remote";
}

/// 一次工具调用的上下文：所属运行、项目记忆、scratch 目录与取消令牌
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: RunId,
    pub call_id: CallId,
    pub memory: ProjectMemory,
    pub scratch_dir: PathBuf,
    pub cancel: CancellationToken,
}

/// 本地工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 与结果均为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（计划中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema，默认接受任意对象
    fn parameters_schema(&self) -> Value {
        any_object()
    }

    fn output_schema(&self) -> Option<Value> {
        None
    }

    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, String>;
}

/// 处理器种类，由 Dispatcher 中的单个 match 分派
#[derive(Clone)]
pub enum ToolHandler {
    Local(Arc<dyn Tool>),
    Script(ScriptTemplate),
    Mcp { server: String, remote_name: String },
}

impl ToolHandler {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolHandler::Local(_) => "local",
            ToolHandler::Script(_) => "script",
            ToolHandler::Mcp { .. } => "mcp",
        }
    }
}

impl std::fmt::Debug for ToolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolHandler::Local(tool) => write!(f, "Local({})", tool.name()),
            ToolHandler::Script(t) => write!(f, "Script({})", t.language),
            ToolHandler::Mcp {
                server,
                remote_name,
            } => write!(f, "Mcp({server}:{remote_name})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
    pub capabilities: Vec<String>,
    pub handler: ToolHandler,
}

impl ToolDescriptor {
    /// 由本地 Tool 生成描述符，schema 与能力取自 Tool 本身
    pub fn local(tool: impl Tool + 'static) -> Self {
        Self::from_tool(Arc::new(tool))
    }

    pub fn from_tool(tool: Arc<dyn Tool>) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            input_schema: tool.parameters_schema(),
            output_schema: tool.output_schema(),
            capabilities: tool.capabilities(),
            handler: ToolHandler::Local(tool),
        }
    }

    pub fn script(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        template: ScriptTemplate,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema: None,
            capabilities: vec![capability::PROCESS_SPAWN.to_string()],
            handler: ToolHandler::Script(template),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

/// 注册后的工具：描述符 + 已编译 schema
#[derive(Debug)]
pub struct RegisteredTool {
    pub descriptor: ToolDescriptor,
    pub input: CompiledSchema,
    pub output: Option<CompiledSchema>,
}

/// list() 返回的工具摘要，供 prompt 与 host 的 tools 命令使用
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub handler: &'static str,
    pub input_schema: Value,
}

/// 工具注册表：按名称存储，租约存在时拒绝注册
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<RegisteredTool>>>,
    leases: Arc<AtomicUsize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: ToolDescriptor) -> Result<(), RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidSchema {
            name: descriptor.name.clone(),
            reason,
        };
        let input = CompiledSchema::compile(&descriptor.input_schema).map_err(invalid)?;
        let output = descriptor
            .output_schema
            .as_ref()
            .map(CompiledSchema::compile)
            .transpose()
            .map_err(invalid)?;

        let mut tools = self.tools.write().unwrap_or_else(|p| p.into_inner());
        if self.leases.load(Ordering::SeqCst) > 0 {
            return Err(RegistryError::RegistryLocked(descriptor.name));
        }
        if tools.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateTool(descriptor.name));
        }
        tracing::debug!(tool = %descriptor.name, handler = descriptor.handler.kind(), "tool registered");
        tools.insert(
            descriptor.name.clone(),
            Arc::new(RegisteredTool {
                descriptor,
                input,
                output,
            }),
        );
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.tools
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// 按名称排序列出工具；给定 capability 时只列出带该标签的工具
    pub fn list(&self, capability: Option<&str>) -> Vec<ToolInfo> {
        let tools = self.tools.read().unwrap_or_else(|p| p.into_inner());
        let mut infos: Vec<ToolInfo> = tools
            .values()
            .filter(|t| match capability {
                Some(cap) => t.descriptor.capabilities.iter().any(|c| c == cap),
                None => true,
            })
            .map(|t| ToolInfo {
                name: t.descriptor.name.clone(),
                description: t.descriptor.description.clone(),
                capabilities: t.descriptor.capabilities.clone(),
                handler: t.descriptor.handler.kind(),
                input_schema: t.descriptor.input_schema.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 获取租约；持有期间注册表关闭
    pub fn lease(&self) -> RegistryLease {
        let _tools = self.tools.read().unwrap_or_else(|p| p.into_inner());
        self.leases.fetch_add(1, Ordering::SeqCst);
        RegistryLease {
            leases: self.leases.clone(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.leases.load(Ordering::SeqCst) > 0
    }
}

/// 运行租约，drop 时释放
#[derive(Debug)]
pub struct RegistryLease {
    leases: Arc<AtomicUsize>,
}

impl Drop for RegistryLease {
    fn drop(&mut self) {
        self.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;
    use serde_json::json;

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = ToolRegistry::new();
        registry.register(ToolDescriptor::local(EchoTool)).unwrap();
        let err = registry.register(ToolDescriptor::local(EchoTool)).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateTool("echo".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lease_locks_registration() {
        let registry = ToolRegistry::new();
        let lease = registry.lease();
        let err = registry.register(ToolDescriptor::local(EchoTool)).unwrap_err();
        assert_eq!(err, RegistryError::RegistryLocked("echo".to_string()));
        drop(lease);
        assert!(!registry.is_locked());
        registry.register(ToolDescriptor::local(EchoTool)).unwrap();
        assert!(registry.contains("echo"));
    }

    #[test]
    fn test_invalid_schema_is_config_error() {
        let registry = ToolRegistry::new();
        let template = ScriptTemplate::new("shell", "true");
        let err = registry
            .register(ToolDescriptor::script(
                "broken",
                "bad schema",
                json!({"type": 12}),
                template,
            ))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSchema { .. }));
    }

    #[test]
    fn test_list_sorted_and_filtered() {
        let registry = ToolRegistry::new();
        registry.register(ToolDescriptor::local(EchoTool)).unwrap();
        registry
            .register(ToolDescriptor::script(
                "analyze",
                "run analysis",
                json!({"type": "object"}),
                ScriptTemplate::new("shell", "echo {{x}}"),
            ))
            .unwrap();
        let names: Vec<String> = registry.list(None).into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["analyze".to_string(), "echo".to_string()]);

        let spawners = registry.list(Some(capability::PROCESS_SPAWN));
        assert_eq!(spawners.len(), 1);
        assert_eq!(spawners[0].handler, "script");
    }
}
