//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__RUNTIME__MAX_TURNS=40`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::sandbox::ResourceLimits;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub runtime: RuntimeSection,
    pub tools: ToolsSection,
    pub sandbox: SandboxSection,
    pub mcp: McpSection,
    pub agents: AgentsSection,
    pub planner: PlannerSection,
}

/// [app] 段：项目存储根
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    /// 项目根目录的父目录，未设置时用 ./projects；项目 `p` 位于 `<storage_root>/p`
    pub storage_root: Option<PathBuf>,
}

/// [runtime] 段：运行状态机与 Supervisor 策略
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSection {
    /// 单步 Acting 阶段内同时在途的工具调用上限
    #[serde(default = "default_max_inflight_calls")]
    pub max_inflight_calls: usize,
    /// 委派深度上限（顶层运行深度为 0）
    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: usize,
    /// 每个运行的最大 Planning 轮数
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// 顶层运行的墙钟预算（秒）；0 表示不限
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// RunEvent 广播通道容量
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// 状态面板保留的已结束运行条数；更早的只能从检查点查询
    #[serde(default = "default_retained_runs")]
    pub retained_runs: usize,
}

fn default_max_inflight_calls() -> usize {
    4
}

fn default_max_delegation_depth() -> usize {
    3
}

fn default_max_turns() -> usize {
    32
}

fn default_run_timeout_secs() -> u64 {
    1800
}

fn default_event_capacity() -> usize {
    256
}

fn default_retained_runs() -> usize {
    256
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            max_inflight_calls: default_max_inflight_calls(),
            max_delegation_depth: default_max_delegation_depth(),
            max_turns: default_max_turns(),
            run_timeout_secs: default_run_timeout_secs(),
            event_capacity: default_event_capacity(),
            retained_runs: default_retained_runs(),
        }
    }
}

/// [tools] 段：本地工具超时、fetchDocument 配置、脚本模板工具
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次本地工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub fetch: FetchSection,
    /// [[tools.scripts]]：以沙箱脚本模板实现的工具
    #[serde(default)]
    pub scripts: Vec<ScriptToolEntry>,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            fetch: FetchSection::default(),
            scripts: Vec::new(),
        }
    }
}

/// [tools.fetch] 段：抓取超时、最大字符数、允许域名、按 ID 取文档的 URL 模板
#[derive(Debug, Clone, Deserialize)]
pub struct FetchSection {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: Vec<String>,
    /// 含 `{id}` 占位符，如 `https://worldwide.espacenet.com/patent/search?q=pn%3D{id}`
    #[serde(default)]
    pub document_url_template: Option<String>,
}

fn default_fetch_timeout_secs() -> u64 {
    15
}

fn default_max_result_chars() -> usize {
    64_000
}

fn default_allowed_domains() -> Vec<String> {
    vec![
        "worldwide.espacenet.com".into(),
        "patents.google.com".into(),
        "data.epo.org".into(),
        "ops.epo.org".into(),
        "patentscope.wipo.int".into(),
        "github.com".into(),
        "raw.githubusercontent.com".into(),
        "docs.rs".into(),
        "crates.io".into(),
        "en.wikipedia.org".into(),
        "arxiv.org".into(),
    ]
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            max_result_chars: default_max_result_chars(),
            allowed_domains: default_allowed_domains(),
            document_url_template: None,
        }
    }
}

/// [[tools.scripts]] 条目：固定脚本模板，`{{key}}` 从调用参数替换
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptToolEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// shell / python / node
    pub language: String,
    pub source: String,
    /// 参数 JSON Schema；缺省为任意对象
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

/// [sandbox] 段：默认/最大资源限制、取消宽限期、解释器
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    #[serde(default)]
    pub default_limits: ResourceLimits,
    /// 智能体请求的限制会被夹到此上限
    #[serde(default = "default_max_limits")]
    pub max_limits: ResourceLimits,
    /// SIGTERM 到 SIGKILL 的宽限期（毫秒）
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// 语言标签 → 解释器命令（首项为程序，其余为前置参数）
    #[serde(default = "default_interpreters")]
    pub interpreters: HashMap<String, Vec<String>>,
}

fn default_max_limits() -> ResourceLimits {
    ResourceLimits {
        max_cpu_ms: 120_000,
        max_memory_bytes: 1024 * 1024 * 1024,
        max_output_bytes: 8 * 1024 * 1024,
        timeout: std::time::Duration::from_secs(600),
    }
}

fn default_grace_ms() -> u64 {
    500
}

fn default_interpreters() -> HashMap<String, Vec<String>> {
    HashMap::from([
        ("shell".to_string(), vec!["sh".to_string()]),
        ("python".to_string(), vec!["python3".to_string(), "-u".to_string()]),
        ("node".to_string(), vec!["node".to_string()]),
    ])
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            default_limits: ResourceLimits::default(),
            max_limits: default_max_limits(),
            grace_ms: default_grace_ms(),
            interpreters: default_interpreters(),
        }
    }
}

/// [mcp] 段：传输错误重试退避、远程工具服务器列表
#[derive(Debug, Clone, Deserialize)]
pub struct McpSection {
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub servers: Vec<McpServerEntry>,
}

fn default_retry_backoff_ms() -> u64 {
    250
}

impl Default for McpSection {
    fn default() -> Self {
        Self {
            retry_backoff_ms: default_retry_backoff_ms(),
            servers: Vec::new(),
        }
    }
}

/// [[mcp.servers]] 条目
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerEntry {
    pub id: String,
    /// 合并进注册表时的名称前缀，缺省为 id
    #[serde(default)]
    pub prefix: Option<String>,
    /// stdio / tcp
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// tcp 传输的 host:port
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_mcp_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_transport() -> String {
    "stdio".to_string()
}

fn default_mcp_timeout_ms() -> u64 {
    20_000
}

impl Default for McpServerEntry {
    fn default() -> Self {
        Self {
            id: String::new(),
            prefix: None,
            transport: default_transport(),
            program: None,
            args: Vec::new(),
            env: HashMap::new(),
            address: None,
            timeout_ms: default_mcp_timeout_ms(),
        }
    }
}

/// [agents] 段：两种智能体配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentsSection {
    #[serde(default)]
    pub reasoning: AgentEntry,
    #[serde(default)]
    pub coding: AgentEntry,
}

/// 单个智能体配置：能力白名单（缺省不限制）与系统提示词
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentEntry {
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// [planner] 段：外部规划进程（未配置时使用 Mock）
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerSection {
    /// 程序及参数；收到 stdin 上的消息 JSON，stdout 输出决策
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default = "default_planner_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_planner_timeout_secs() -> u64 {
    120
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_planner_timeout_secs(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
