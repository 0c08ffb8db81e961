//! 工具输入 / 输出的 JSON Schema（draft 7），注册时编译，调用时校验

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

/// 已编译的 schema，保留原始文档用于调试输出
pub struct CompiledSchema {
    raw: Value,
    compiled: JSONSchema,
}

impl std::fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSchema").field("raw", &self.raw).finish()
    }
}

impl CompiledSchema {
    pub fn compile(schema: &Value) -> Result<Self, String> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| e.to_string())?;
        Ok(Self {
            raw: schema.clone(),
            compiled,
        })
    }

    /// 校验失败时返回全部错误信息（含实例路径）
    pub fn validate(&self, instance: &Value) -> Result<(), Vec<String>> {
        match self.compiled.validate(instance) {
            Ok(()) => Ok(()),
            Err(errors) => Err(errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{path}: {e}")
                    }
                })
                .collect()),
        }
    }
}

/// 无参数约束的对象 schema
pub fn any_object() -> Value {
    serde_json::json!({ "type": "object" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_reports_every_error() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "limit": { "type": "integer", "minimum": 1 }
            },
            "required": ["id"]
        }))
        .unwrap();

        assert!(schema.validate(&json!({"id": "EP1234567"})).is_ok());
        let errors = schema.validate(&json!({"limit": 0})).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("/limit")));
    }

    #[test]
    fn test_invalid_schema_rejected_at_compile() {
        assert!(CompiledSchema::compile(&json!({"type": "no-such-type"})).is_err());
    }
}
