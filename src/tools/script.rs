//! 脚本工具：由配置 [[tools.scripts]] 注册的固定模板，或 runScript 这类从参数取源码的动态脚本
//!
//! 模板中 {{workspace}} 替换为运行的 scratch 目录，{{key}} 从调用 args 中取 key；
//! 解析结果交给 Dispatcher 构造沙箱作业。

use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::ScriptToolEntry;
use crate::sandbox::ResourceLimits;
use crate::tools::registry::{capability, ToolDescriptor};

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptTemplate {
    pub language: String,
    /// None 表示源码来自调用参数 `source`
    pub source: Option<String>,
    pub artifacts: Vec<String>,
    pub limits: Option<ResourceLimits>,
}

/// 替换完成、可直接执行的脚本
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedScript {
    pub language: String,
    pub source: String,
    pub artifacts: Vec<String>,
    pub limits: Option<ResourceLimits>,
}

#[derive(Deserialize)]
struct DynamicScriptArgs {
    source: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    artifacts: Vec<String>,
    #[serde(default)]
    limits: Option<ResourceLimits>,
}

impl ScriptTemplate {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: Some(source.into()),
            artifacts: Vec::new(),
            limits: None,
        }
    }

    /// 源码、语言、产物均由调用参数给出
    pub fn from_args(default_language: impl Into<String>) -> Self {
        Self {
            language: default_language.into(),
            source: None,
            artifacts: Vec::new(),
            limits: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn resolve(&self, args: &Value, workspace: &Path) -> Result<ResolvedScript, String> {
        match &self.source {
            Some(template) => Ok(ResolvedScript {
                language: self.language.clone(),
                source: substitute(template, args, workspace),
                artifacts: self
                    .artifacts
                    .iter()
                    .map(|a| substitute(a, args, workspace))
                    .collect(),
                limits: self.limits.clone(),
            }),
            None => {
                let dynamic: DynamicScriptArgs = serde_json::from_value(args.clone())
                    .map_err(|e| format!("invalid script arguments: {e}"))?;
                Ok(ResolvedScript {
                    language: dynamic.language.unwrap_or_else(|| self.language.clone()),
                    source: dynamic.source,
                    artifacts: dynamic.artifacts,
                    limits: dynamic.limits,
                })
            }
        }
    }
}

/// 替换模板中的 {{workspace}} 和 {{key}}；字符串值原样替换，其它值用 JSON 文本
fn substitute(template: &str, args: &Value, workspace: &Path) -> String {
    let workspace_str = workspace.to_string_lossy();
    let mut s = template.replace("{{workspace}}", &workspace_str);
    if let Some(obj) = args.as_object() {
        for (k, v) in obj {
            let placeholder = format!("{{{{{}}}}}", k);
            let val: String = match v {
                Value::String(x) => x.clone(),
                _ => v.to_string(),
            };
            s = s.replace(&placeholder, &val);
        }
    }
    s
}

/// 内置 runScript 工具的描述符
pub fn run_script_descriptor() -> ToolDescriptor {
    ToolDescriptor::script(
        "runScript",
        "Run a generated script in the sandbox. Args: {\"source\": \"...\", \"language\": \"shell|python|node\", \"artifacts\": [\"out/result.json\"], \"limits\": {\"timeout\": 2000}}. Returns exit code, stdout/stderr and committed artifacts.",
        json!({
            "type": "object",
            "properties": {
                "source": { "type": "string" },
                "language": { "type": "string" },
                "artifacts": { "type": "array", "items": { "type": "string" } },
                "limits": { "type": "object" }
            },
            "required": ["source"]
        }),
        ScriptTemplate::from_args("shell"),
    )
}

/// 从配置条目构建模板脚本工具
pub fn script_descriptor(entry: &ScriptToolEntry) -> ToolDescriptor {
    let mut template = ScriptTemplate::new(entry.language.clone(), entry.source.clone())
        .with_artifacts(entry.artifacts.clone());
    if let Some(limits) = &entry.limits {
        template = template.with_limits(limits.clone());
    }
    let schema = entry
        .input_schema
        .clone()
        .unwrap_or_else(|| json!({ "type": "object" }));
    let capabilities = if entry.capabilities.is_empty() {
        vec![capability::PROCESS_SPAWN.to_string()]
    } else {
        entry.capabilities.clone()
    };
    ToolDescriptor::script(entry.name.clone(), entry.description.clone(), schema, template)
        .with_capabilities(capabilities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_template_substitution() {
        let template = ScriptTemplate::new("shell", "grep -c {{term}} {{workspace}}/doc.txt")
            .with_artifacts(vec!["{{term}}.count".to_string()]);
        let resolved = template
            .resolve(
                &json!({"term": "claim", "n": 3}),
                &PathBuf::from("/tmp/scratch"),
            )
            .unwrap();
        assert_eq!(resolved.source, "grep -c claim /tmp/scratch/doc.txt");
        assert_eq!(resolved.artifacts, vec!["claim.count".to_string()]);
        assert_eq!(resolved.language, "shell");
    }

    #[test]
    fn test_dynamic_script_from_args() {
        let template = ScriptTemplate::from_args("shell");
        let resolved = template
            .resolve(
                &json!({"source": "print(1)", "language": "python", "limits": {"timeout": 2000}}),
                Path::new("/x"),
            )
            .unwrap();
        assert_eq!(resolved.language, "python");
        assert_eq!(resolved.source, "print(1)");
        assert_eq!(
            resolved.limits.unwrap().timeout,
            std::time::Duration::from_secs(2)
        );
        assert!(template.resolve(&json!({}), Path::new("/x")).is_err());
    }
}
