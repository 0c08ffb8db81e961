//! 沙箱作业描述与产物路径校验

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::ids::{JobId, RunId};
use crate::sandbox::limits::ResourceLimits;
use crate::sandbox::SandboxError;

/// 脚本来源：内联源码或项目内已有文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptSource {
    Inline(String),
    Path(PathBuf),
}

/// 一次隔离执行的完整描述
#[derive(Debug, Clone)]
pub struct SandboxJob {
    pub id: JobId,
    pub run_id: RunId,
    /// 语言标签（shell / python / node 或配置中的自定义项）
    pub language: String,
    pub source: ScriptSource,
    pub limits: ResourceLimits,
    /// 声明的产物路径（相对作业目录）
    pub artifacts: Vec<String>,
    /// 额外环境变量；宿主环境除 PATH 外全部清空
    pub env: HashMap<String, String>,
}

impl SandboxJob {
    pub fn new(run_id: RunId, language: impl Into<String>, source: ScriptSource) -> Self {
        Self {
            id: JobId::new(),
            run_id,
            language: language.into(),
            source,
            limits: ResourceLimits::default(),
            artifacts: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// 产物路径必须是相对路径，且只含普通路径段（不允许 `..`、根或盘符）
pub fn validate_artifact_path(raw: &str) -> Result<PathBuf, SandboxError> {
    let violation = |reason: &str| SandboxError::Violation {
        path: raw.to_string(),
        reason: reason.to_string(),
    };
    if raw.trim().is_empty() {
        return Err(violation("empty artifact path"));
    }
    let path = Path::new(raw);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(violation("path escapes the job directory")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(violation("artifact path must be relative"))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(violation("artifact path names no file"));
    }
    Ok(clean)
}
