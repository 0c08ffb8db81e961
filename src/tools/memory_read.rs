//! memoryRead 工具：读取项目记忆中的一个键（带 revision）

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::registry::{capability, Tool, ToolContext};

pub struct MemoryReadTool;

#[async_trait]
impl Tool for MemoryReadTool {
    fn name(&self) -> &str {
        "memoryRead"
    }

    fn description(&self) -> &str {
        "Read a project memory record. Args: {\"key\": \"doc:EP1234567\"}. Returns {\"key\", \"found\", \"value\", \"revision\"}."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "key": { "type": "string", "minLength": 1 } },
            "required": ["key"]
        })
    }

    fn output_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "key": { "type": "string" },
                "found": { "type": "boolean" },
                "revision": { "type": "integer", "minimum": 0 }
            },
            "required": ["key", "found", "revision"]
        }))
    }

    fn capabilities(&self) -> Vec<String> {
        vec![capability::ANALYSIS.to_string()]
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, String> {
        let key = args
            .get("key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "Missing key".to_string())?;
        let record = ctx.memory.read(key).await.map_err(|e| e.to_string())?;
        Ok(match record {
            Some(v) => json!({ "key": key, "found": true, "value": v.value, "revision": v.revision }),
            None => json!({ "key": key, "found": false, "value": null, "revision": 0 }),
        })
    }
}
