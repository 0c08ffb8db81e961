//! 智能体配置：两种智能体共用一台状态机，只在规划能力与能力白名单上不同

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::react::planner::Planner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Reasoning,
    Coding,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Reasoning => "reasoning",
            AgentKind::Coding => "coding",
        }
    }

    /// 可委派的另一种智能体
    pub fn other(self) -> Self {
        match self {
            AgentKind::Reasoning => AgentKind::Coding,
            AgentKind::Coding => AgentKind::Reasoning,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reasoning" => Ok(AgentKind::Reasoning),
            "coding" => Ok(AgentKind::Coding),
            other => Err(format!("unknown agent '{other}'")),
        }
    }
}

#[derive(Clone)]
pub struct AgentProfile {
    pub kind: AgentKind,
    pub planner: Arc<dyn Planner>,
    /// None 表示可使用全部工具
    pub capabilities: Option<Vec<String>>,
}

impl AgentProfile {
    pub fn new(kind: AgentKind, planner: Arc<dyn Planner>) -> Self {
        Self {
            kind,
            planner,
            capabilities: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Option<Vec<String>>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl fmt::Debug for AgentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentProfile")
            .field("kind", &self.kind)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}
