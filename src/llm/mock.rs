//! Mock LLM 客户端（用于测试与未配置规划进程时，无需 API）
//!
//! 取最后一条 User 消息，直接给出 finish 决策，便于本地跑通整条运行流程。

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// Mock 客户端：把用户最后一条消息作为结果回显
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(serde_json::json!({
            "decision": "finish",
            "result": { "echo": last_user },
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_mock_finishes_with_last_user_message() {
        let client = MockLlmClient;
        let out = client
            .complete(&[Message::system("sys"), Message::user("hello")])
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["decision"], "finish");
        assert_eq!(v["result"]["echo"], "hello");

        let mut stream = client.complete_stream(&[Message::user("x")]).await.unwrap();
        assert!(stream.next().await.unwrap().unwrap().contains("finish"));
    }
}
