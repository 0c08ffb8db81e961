//! MCP 网关：管理各服务器会话，attach 时把远程工具并入注册表（`<prefix>.<name>`）

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;

use crate::config::McpServerEntry;
use crate::core::RegistryError;
use crate::mcp::client::{McpEndpoint, McpSession, RemoteTool};
use crate::mcp::McpError;
use crate::tools::registry::{capability, ToolDescriptor, ToolHandler, ToolRegistry};
use crate::tools::schema::any_object;

#[derive(Default)]
pub struct McpGateway {
    sessions: RwLock<HashMap<String, Arc<McpSession>>>,
}

impl McpGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// 建立会话（已存在同 id 会话时复用）并完成握手
    pub async fn connect(
        &self,
        id: &str,
        endpoint: McpEndpoint,
        request_timeout: Duration,
    ) -> Result<Arc<McpSession>, McpError> {
        let session = {
            let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
            sessions
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(McpSession::new(id, endpoint, request_timeout)))
                .clone()
        };
        session.connect().await?;
        Ok(session)
    }

    pub fn session(&self, id: &str) -> Option<Arc<McpSession>> {
        self.sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    pub async fn list_remote_tools(&self, id: &str) -> Result<Vec<RemoteTool>, McpError> {
        let session = self
            .session(id)
            .ok_or_else(|| McpError::UnknownServer(id.to_string()))?;
        session.list_tools().await
    }

    pub async fn invoke(
        &self,
        id: &str,
        tool: &str,
        args: Value,
        limit: Option<Duration>,
    ) -> Result<Value, McpError> {
        let session = self
            .session(id)
            .ok_or_else(|| McpError::UnknownServer(id.to_string()))?;
        session.call_tool(tool, args, limit).await
    }

    /// 连接配置中的服务器并注册其全部远程工具，返回注册后的工具名
    pub async fn attach(
        &self,
        entry: &McpServerEntry,
        registry: &ToolRegistry,
    ) -> Result<Vec<String>, McpError> {
        let endpoint = McpEndpoint::from_entry(entry)?;
        let session = self
            .connect(&entry.id, endpoint, Duration::from_millis(entry.timeout_ms))
            .await?;
        let prefix = entry.prefix.clone().unwrap_or_else(|| entry.id.clone());
        let mut names = Vec::new();
        for remote in session.list_tools().await? {
            let name = format!("{prefix}.{}", remote.name);
            register_remote(registry, &entry.id, &name, remote)?;
            names.push(name);
        }
        tracing::info!(server = %entry.id, tools = names.len(), "mcp server attached");
        Ok(names)
    }
}

fn register_remote(
    registry: &ToolRegistry,
    server: &str,
    name: &str,
    remote: RemoteTool,
) -> Result<(), McpError> {
    let schema = if remote.input_schema.is_object() {
        remote.input_schema
    } else {
        any_object()
    };
    let descriptor = ToolDescriptor {
        name: name.to_string(),
        description: remote.description,
        input_schema: schema,
        output_schema: None,
        capabilities: vec![capability::REMOTE.to_string()],
        handler: ToolHandler::Mcp {
            server: server.to_string(),
            remote_name: remote.name,
        },
    };
    match registry.register(descriptor.clone()) {
        Err(RegistryError::InvalidSchema { reason, .. }) => {
            tracing::warn!(tool = %name, reason = %reason, "remote schema rejected, accepting any object");
            registry
                .register(ToolDescriptor {
                    input_schema: any_object(),
                    ..descriptor
                })
                .map_err(McpError::Registry)
        }
        other => other.map_err(McpError::Registry),
    }
}
