//! Supervisor 构建器：统一的组件装配
//!
//! 注册内置工具与配置中的脚本工具，连接 MCP 服务器，按配置选择规划后端，
//! 最后组装 Dispatcher → AgentRuntime → Supervisor。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::AppConfig;
use crate::core::state::StatusBoard;
use crate::core::supervisor::{Supervisor, SupervisorOptions};
use crate::core::RecoveryEngine;
use crate::llm::{CommandLlmClient, LlmClient, MockLlmClient};
use crate::mcp::{McpError, McpGateway};
use crate::react::{AgentKind, AgentProfile, AgentRuntime, LlmPlanner, Planner, RunLimits, RuntimeOptions};
use crate::sandbox::SandboxExecutor;
use crate::tools::{
    run_script_descriptor, script_descriptor, EchoTool, FetchDocumentTool, MemoryReadTool,
    ToolDescriptor, ToolDispatcher, ToolRegistry,
};

const REASONING_PROMPT: &str = "You are the reasoning agent. Break the task down, gather documents with tools, keep findings in project memory and delegate implementation work to the coding agent.";
const CODING_PROMPT: &str = "You are the coding agent. Write and run scripts in the sandbox to compute what the task asks for, declare the artifacts you produce and report the result.";

pub struct SupervisorBuilder {
    config: AppConfig,
    planners: HashMap<AgentKind, Arc<dyn Planner>>,
    tools: Vec<ToolDescriptor>,
    storage_root: Option<PathBuf>,
}

impl SupervisorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            planners: HashMap::new(),
            tools: Vec::new(),
            storage_root: None,
        }
    }

    /// 覆盖某种智能体的规划能力
    pub fn with_planner(mut self, kind: AgentKind, planner: Arc<dyn Planner>) -> Self {
        self.planners.insert(kind, planner);
        self
    }

    /// 追加工具（在内置工具之后注册）
    pub fn with_tool(mut self, descriptor: ToolDescriptor) -> Self {
        self.tools.push(descriptor);
        self
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    pub async fn build(self) -> anyhow::Result<Supervisor> {
        let cfg = self.config;

        let registry = Arc::new(ToolRegistry::new());
        registry.register(ToolDescriptor::local(EchoTool))?;
        registry.register(ToolDescriptor::local(MemoryReadTool))?;
        registry.register(ToolDescriptor::local(FetchDocumentTool::new(&cfg.tools.fetch)))?;
        registry.register(run_script_descriptor())?;
        for entry in &cfg.tools.scripts {
            registry
                .register(script_descriptor(entry))
                .with_context(|| format!("script tool '{}'", entry.name))?;
        }
        for descriptor in self.tools {
            registry.register(descriptor)?;
        }

        let mcp = Arc::new(McpGateway::new());
        for server in &cfg.mcp.servers {
            match mcp.attach(server, &registry).await {
                Ok(names) => tracing::info!(server = %server.id, tools = ?names, "remote tools registered"),
                Err(e @ (McpError::Config(_) | McpError::Registry(_))) => {
                    return Err(e).with_context(|| format!("mcp server '{}'", server.id));
                }
                Err(e) => tracing::warn!(server = %server.id, error = %e, "mcp server unavailable, skipped"),
            }
        }

        let sandbox = Arc::new(SandboxExecutor::new(
            cfg.sandbox.interpreters.clone(),
            cfg.sandbox.max_limits.clone(),
            Duration::from_millis(cfg.sandbox.grace_ms),
        ));
        let recovery = RecoveryEngine::new(Duration::from_millis(cfg.mcp.retry_backoff_ms));
        let dispatcher = Arc::new(ToolDispatcher::new(
            registry.clone(),
            sandbox,
            mcp,
            recovery.clone(),
            Duration::from_secs(cfg.tools.tool_timeout_secs),
            cfg.sandbox.default_limits.clone(),
        ));

        let llm: Option<Arc<dyn LlmClient>> = cfg
            .planner
            .command
            .as_deref()
            .and_then(|command| {
                CommandLlmClient::new(command, Duration::from_secs(cfg.planner.timeout_secs))
            })
            .map(|client| Arc::new(client) as Arc<dyn LlmClient>);
        let mut planners = self.planners;
        let profiles = [AgentKind::Reasoning, AgentKind::Coding]
            .into_iter()
            .map(|kind| {
                let entry = match kind {
                    AgentKind::Reasoning => &cfg.agents.reasoning,
                    AgentKind::Coding => &cfg.agents.coding,
                };
                let planner = planners.remove(&kind).unwrap_or_else(|| {
                    let prompt = entry.system_prompt.clone().unwrap_or_else(|| {
                        match kind {
                            AgentKind::Reasoning => REASONING_PROMPT,
                            AgentKind::Coding => CODING_PROMPT,
                        }
                        .to_string()
                    });
                    let client = llm
                        .clone()
                        .unwrap_or_else(|| Arc::new(MockLlmClient) as Arc<dyn LlmClient>);
                    Arc::new(LlmPlanner::new(client, prompt)) as Arc<dyn Planner>
                });
                AgentProfile::new(kind, planner).with_capabilities(entry.capabilities.clone())
            })
            .collect();
        if llm.is_none() {
            tracing::info!("no planner command configured, using mock planner");
        }

        let runtime = AgentRuntime::new(
            dispatcher,
            profiles,
            Arc::new(StatusBoard::with_retention(cfg.runtime.retained_runs)),
            recovery,
            RuntimeOptions {
                max_inflight_calls: cfg.runtime.max_inflight_calls,
                max_delegation_depth: cfg.runtime.max_delegation_depth,
                event_capacity: cfg.runtime.event_capacity,
            },
        );
        let storage_root = self
            .storage_root
            .or(cfg.app.storage_root)
            .unwrap_or_else(|| PathBuf::from("projects"));
        let limits = RunLimits {
            max_turns: cfg.runtime.max_turns,
            budget: (cfg.runtime.run_timeout_secs > 0)
                .then(|| Duration::from_secs(cfg.runtime.run_timeout_secs)),
        };
        tracing::info!(tools = registry.len(), storage_root = %storage_root.display(), "supervisor ready");
        Ok(Supervisor::new(
            runtime,
            registry,
            SupervisorOptions {
                storage_root,
                limits,
            },
        ))
    }
}
