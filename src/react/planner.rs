//! Planner：规划能力与决策解析
//!
//! 每轮 Planning 把快照与步骤历史交给 Planner，得到四种决策之一：
//! 发出工具调用（可附显式记忆写入）、委派、给出结果、放弃。
//! LlmPlanner 把上下文渲染为消息交给 LlmClient，parse_decision 从回复中提取 JSON 决策。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ids::RunId;
use crate::llm::{LlmClient, Message};
use crate::memory::MemorySnapshot;
use crate::react::memory::StepRecord;
use crate::react::AgentKind;
use crate::tools::ToolInfo;

/// Acting 阶段的一个调用请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolCallRequest {
    /// 步内标签，供 depends_on 引用
    #[serde(default)]
    pub label: Option<String>,
    pub tool: String,
    #[serde(default = "empty_args")]
    pub args: Value,
    /// 同一步中必须先成功的调用标签
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// 成功结果写入的记忆键
    #[serde(default)]
    pub store_as: Option<String>,
}

fn empty_args() -> Value {
    Value::Object(Default::default())
}

impl ToolCallRequest {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            label: None,
            tool: tool.into(),
            args,
            depends_on: Vec::new(),
            store_as: None,
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn after(mut self, label: impl Into<String>) -> Self {
        self.depends_on.push(label.into());
        self
    }

    pub fn store_as(mut self, key: impl Into<String>) -> Self {
        self.store_as = Some(key.into());
        self
    }
}

/// 显式记忆写入；expected_revision 为 0 表示键必须不存在
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MemoryWriteRequest {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub expected_revision: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Act {
        #[serde(default)]
        calls: Vec<ToolCallRequest>,
        #[serde(default)]
        memory_writes: Vec<MemoryWriteRequest>,
    },
    Delegate {
        target: AgentKind,
        #[serde(default)]
        task: Value,
    },
    Finish {
        #[serde(default)]
        result: Value,
    },
    GiveUp {
        reason: String,
    },
}

impl Decision {
    pub fn act(calls: Vec<ToolCallRequest>) -> Self {
        Decision::Act {
            calls,
            memory_writes: Vec::new(),
        }
    }

    pub fn finish(result: Value) -> Self {
        Decision::Finish { result }
    }
}

/// 一轮 Planning 的输入
#[derive(Debug, Clone)]
pub struct PlanningContext<'a> {
    pub run_id: RunId,
    pub parent: Option<RunId>,
    pub agent: AgentKind,
    pub depth: usize,
    /// 本轮将产生的步骤序号
    pub step: usize,
    pub task: &'a Value,
    pub snapshot: &'a MemorySnapshot,
    pub steps: &'a [StepRecord],
    /// 本智能体可用的工具
    pub tools: &'a [ToolInfo],
}

/// 规划能力；返回 Err 时运行以 PlannerFailed 结束
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, ctx: &PlanningContext<'_>) -> Result<Decision, String>;
}

/// 决策的 JSON Schema，拼入 prompt
pub fn decision_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(Decision)).unwrap_or(Value::Null)
}

/// 从 LLM 文本中提取 JSON 决策（```json ... ``` 或首个 `{` 到最后一个 `}`）
pub fn parse_decision(output: &str) -> Result<Decision, String> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start <= end {
            &trimmed[start..=end]
        } else {
            trimmed
        }
    } else {
        return Err(format!("no JSON decision in planner output: {trimmed}"));
    };

    serde_json::from_str(json_str).map_err(|e| format!("{e}: {json_str}"))
}

/// 以 LLM 实现的 Planner：持有 LlmClient 与 system prompt
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    pub fn base_system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// system：角色提示 + 工具列表 + 决策 schema；user：任务、快照与历史
    pub fn render(&self, ctx: &PlanningContext<'_>) -> Vec<Message> {
        let tools: Vec<Value> = ctx
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                })
            })
            .collect();
        let system = format!(
            "{}\n\nYou are the {} agent (delegation depth {}).\n\nAvailable tools:\n{}\n\nReply with exactly one JSON object matching this schema:\n{}",
            self.system_prompt,
            ctx.agent,
            ctx.depth,
            serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string()),
            serde_json::to_string_pretty(&decision_schema()).unwrap_or_default(),
        );

        let memory: serde_json::Map<String, Value> = ctx
            .snapshot
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect();
        let user = serde_json::json!({
            "task": ctx.task,
            "step": ctx.step,
            "memory": memory,
            "history": ctx.steps,
        });

        vec![Message::system(system), Message::user(user.to_string())]
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, ctx: &PlanningContext<'_>) -> Result<Decision, String> {
        let messages = self.render(ctx);
        let output = self.llm.complete(&messages).await?;
        tracing::debug!(run = %ctx.run_id, step = ctx.step, output_len = output.len(), "planner replied");
        parse_decision(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use serde_json::json;

    #[test]
    fn test_parse_fenced_act() {
        let out = "Thinking...\n```json\n{\"decision\":\"act\",\"calls\":[{\"tool\":\"fetchDocument\",\"args\":{\"id\":\"EP1\"},\"store_as\":\"doc:EP1\"}]}\n```";
        match parse_decision(out).unwrap() {
            Decision::Act {
                calls,
                memory_writes,
            } => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].store_as.as_deref(), Some("doc:EP1"));
                assert!(calls[0].depends_on.is_empty());
                assert!(memory_writes.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_bare_json_and_defaults() {
        let d = parse_decision(r#"ok {"decision":"act","calls":[{"tool":"echo"}]} done"#).unwrap();
        assert_eq!(d, Decision::act(vec![ToolCallRequest::new("echo", json!({}))]));

        let d = parse_decision(r#"{"decision":"delegate","target":"coding","task":{"goal":"x"}}"#)
            .unwrap();
        assert_eq!(
            d,
            Decision::Delegate {
                target: AgentKind::Coding,
                task: json!({"goal": "x"})
            }
        );
    }

    #[test]
    fn test_parse_rejects_text_and_unknown_decision() {
        assert!(parse_decision("I am done").is_err());
        assert!(parse_decision(r#"{"decision":"dance"}"#).is_err());
    }

    #[test]
    fn test_schema_mentions_every_decision() {
        let schema = decision_schema().to_string();
        for tag in ["act", "delegate", "finish", "give_up"] {
            assert!(schema.contains(tag), "missing {tag}");
        }
    }

    #[tokio::test]
    async fn test_llm_planner_with_mock() {
        let planner = LlmPlanner::new(Arc::new(MockLlmClient), "You plan.");
        let task = json!("summarise EP1");
        let snapshot = MemorySnapshot::default();
        let ctx = PlanningContext {
            run_id: RunId::new(),
            parent: None,
            agent: AgentKind::Reasoning,
            depth: 0,
            step: 0,
            task: &task,
            snapshot: &snapshot,
            steps: &[],
            tools: &[],
        };
        let messages = planner.render(&ctx);
        assert!(messages[0].content.contains("reasoning agent"));
        assert!(messages[1].content.contains("summarise EP1"));
        match planner.plan(&ctx).await.unwrap() {
            Decision::Finish { result } => assert!(result["echo"].as_str().unwrap().contains("EP1")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
