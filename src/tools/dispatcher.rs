//! 工具分派器
//!
//! 调用顺序：查找工具 → 能力白名单 → 输入 schema 校验（失败则不调用处理器）→
//! 按处理器种类分派（本地工具加超时；脚本构造沙箱作业；MCP 传输错误按恢复引擎重试一次）→
//! 输出 schema 校验。每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::ids::CallId;
use crate::core::{ObservationError, RecoveryAction, RecoveryEngine};
use crate::mcp::McpGateway;
use crate::sandbox::{JobContext, ResourceLimits, SandboxExecutor, SandboxJob, ScriptSource};
use crate::tools::registry::{RegisteredTool, ToolContext, ToolHandler, ToolRegistry};
use crate::tools::script::ScriptTemplate;

/// 一次已解析的工具调用
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub call_id: CallId,
    pub tool: String,
    pub args: Value,
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    sandbox: Arc<SandboxExecutor>,
    mcp: Arc<McpGateway>,
    recovery: RecoveryEngine,
    tool_timeout: Duration,
    default_limits: ResourceLimits,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        sandbox: Arc<SandboxExecutor>,
        mcp: Arc<McpGateway>,
        recovery: RecoveryEngine,
        tool_timeout: Duration,
        default_limits: ResourceLimits,
    ) -> Self {
        Self {
            registry,
            sandbox,
            mcp,
            recovery,
            tool_timeout,
            default_limits,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn sandbox(&self) -> &Arc<SandboxExecutor> {
        &self.sandbox
    }

    pub fn mcp(&self) -> &Arc<McpGateway> {
        &self.mcp
    }

    /// 分派一次调用；allowed 为调用方智能体的能力白名单（None 表示不限制）
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        allowed: Option<&[String]>,
    ) -> Result<Value, ObservationError> {
        let start = Instant::now();
        let result = self.dispatch_inner(call, ctx, allowed).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind().as_str(),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.tool,
            "run": ctx.run_id.to_string(),
            "call_id": call.call_id.as_str(),
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        result
    }

    async fn dispatch_inner(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        allowed: Option<&[String]>,
    ) -> Result<Value, ObservationError> {
        let tool = self
            .registry
            .lookup(&call.tool)
            .ok_or_else(|| ObservationError::UnknownTool {
                tool: call.tool.clone(),
            })?;

        if let Some(allowed) = allowed {
            if let Some(missing) = tool
                .descriptor
                .capabilities
                .iter()
                .find(|c| !allowed.contains(c))
            {
                return Err(ObservationError::CapabilityDenied {
                    tool: call.tool.clone(),
                    capability: missing.clone(),
                });
            }
        }

        tool.input
            .validate(&call.args)
            .map_err(|errors| ObservationError::SchemaValidationError { errors })?;

        if ctx.cancel.is_cancelled() {
            return Err(ObservationError::Cancelled);
        }

        let output = match &tool.descriptor.handler {
            ToolHandler::Local(local) => {
                let limit = self.tool_timeout;
                tokio::select! {
                    result = timeout(limit, local.execute(call.args.clone(), ctx)) => match result {
                        Ok(Ok(value)) => value,
                        Ok(Err(message)) => return Err(ObservationError::HandlerFailed { message }),
                        Err(_) => return Err(ObservationError::TimedOut { limit_ms: limit.as_millis() as u64 }),
                    },
                    _ = ctx.cancel.cancelled() => return Err(ObservationError::Cancelled),
                }
            }
            ToolHandler::Script(template) => self.run_script(template, &call.args, ctx).await?,
            ToolHandler::Mcp {
                server,
                remote_name,
            } => self.call_remote(server, remote_name, &call.args, ctx).await?,
        };

        check_output(&tool, &output)?;
        Ok(output)
    }

    async fn run_script(
        &self,
        template: &ScriptTemplate,
        args: &Value,
        ctx: &ToolContext,
    ) -> Result<Value, ObservationError> {
        let script = template
            .resolve(args, &ctx.scratch_dir)
            .map_err(ObservationError::handler)?;
        let limits = script
            .limits
            .unwrap_or_else(|| self.default_limits.clone());
        let job = SandboxJob::new(ctx.run_id, script.language, ScriptSource::Inline(script.source))
            .with_limits(limits)
            .with_artifacts(script.artifacts);
        let job_ctx = JobContext {
            scratch_dir: ctx.scratch_dir.clone(),
            memory: Some(ctx.memory.clone()),
            cancel: ctx.cancel.clone(),
        };
        let report = self.sandbox.run(job, &job_ctx).await?;
        serde_json::to_value(&report).map_err(|e| ObservationError::handler(e.to_string()))
    }

    async fn call_remote(
        &self,
        server: &str,
        remote_name: &str,
        args: &Value,
        ctx: &ToolContext,
    ) -> Result<Value, ObservationError> {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                r = self.mcp.invoke(server, remote_name, args.clone(), Some(self.tool_timeout)) => r,
                _ = ctx.cancel.cancelled() => return Err(ObservationError::Cancelled),
            };
            let err: ObservationError = match result {
                Ok(value) => return Ok(value),
                Err(e) => e.into(),
            };
            match self.recovery.for_observation(&err, attempt) {
                RecoveryAction::RetryAfter(backoff) => {
                    tracing::warn!(server, tool = remote_name, error = %err, "retrying remote call");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = ctx.cancel.cancelled() => return Err(ObservationError::Cancelled),
                    }
                    attempt += 1;
                }
                _ => return Err(err),
            }
        }
    }
}

fn check_output(tool: &RegisteredTool, output: &Value) -> Result<(), ObservationError> {
    match &tool.output {
        Some(schema) => schema
            .validate(output)
            .map_err(|errors| ObservationError::InvalidOutput { errors }),
        None => Ok(()),
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
