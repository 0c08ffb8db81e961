//! Agent Runtime：规划能力、智能体配置、运行工作记忆与状态机主循环

pub mod events;
pub mod loop_;
pub mod memory;
pub mod planner;
pub mod profile;

pub use events::RunEvent;
pub use loop_::{AgentRuntime, RunLimits, RunOutcome, RunRequest, RuntimeOptions};
pub use memory::{
    CallRecord, DelegationRecord, MemoryWriteRecord, Observation, RunContext, StepRecord,
};
pub use planner::{
    decision_schema, parse_decision, Decision, LlmPlanner, MemoryWriteRequest, Planner,
    PlanningContext, ToolCallRequest,
};
pub use profile::{AgentKind, AgentProfile};
