//! 外部规划进程客户端
//!
//! 每次 complete 启动一次配置的程序：消息数组 JSON 写入 stdin，stdout 全文即回复。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::llm::{LlmClient, Message};

#[derive(Debug, Clone)]
pub struct CommandLlmClient {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandLlmClient {
    /// command 首项为程序，其余为参数
    pub fn new(command: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }
}

#[async_trait]
impl LlmClient for CommandLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let payload = serde_json::to_vec(messages).map_err(|e| e.to_string())?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to start planner '{}': {e}", self.program))?;

        // 程序可能不读 stdin 就退出；此时以退出状态和 stderr 为准
        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(format!("planner stdin: {e}")),
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| format!("planner timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| format!("planner: {e}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "planner exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipes_messages_through_program() {
        let client = CommandLlmClient::new(&["cat".to_string()], Duration::from_secs(5)).unwrap();
        let out = client.complete(&[Message::user("ping")]).await.unwrap();
        let echoed: Vec<Message> = serde_json::from_str(&out).unwrap();
        assert_eq!(echoed, vec![Message::user("ping")]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let client = CommandLlmClient::new(
            &["sh".to_string(), "-c".to_string(), "echo boom >&2; exit 3".to_string()],
            Duration::from_secs(5),
        )
        .unwrap();
        let err = client.complete(&[]).await.unwrap_err();
        assert!(err.contains("boom"));
    }

    #[tokio::test]
    async fn test_exit_without_reading_stdin_reports_stderr() {
        let client = CommandLlmClient::new(
            &["sh".to_string(), "-c".to_string(), "echo refused >&2; exit 4".to_string()],
            Duration::from_secs(5),
        )
        .unwrap();
        // 远大于管道缓冲区，写入必然撞上已关闭的读端
        let big = Message::user("x".repeat(1024 * 1024));
        let err = client.complete(&[big]).await.unwrap_err();
        assert!(err.contains("refused"), "{err}");
        assert!(err.contains("exited"), "{err}");
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandLlmClient::new(&[], Duration::from_secs(1)).is_none());
    }
}
