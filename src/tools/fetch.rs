//! fetchDocument 工具：域名白名单、超时、结果大小限制
//!
//! 文档地址来自 `url` 参数，或用 `id` 填充配置中的 document_url_template（`{id}` 占位）。
//! 仅允许白名单域名；HTML 响应用 html2text 提取可读文本；
//! 超过 max_result_chars 时截断并在结果中标记 truncated。

use std::collections::HashSet;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::FetchSection;
use crate::tools::registry::{capability, Tool, ToolContext};

pub struct FetchDocumentTool {
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
    url_template: Option<String>,
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 判断内容是否像 HTML（需提取可读文本）
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.starts_with("<html")
        || s.starts_with("<HTML")
        || (s.len() > 20
            && s.contains('<')
            && (s.contains("</") || s.contains("<head") || s.contains("<title")))
}

/// 从 URL 中提取 host（去掉端口与路径）
fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let url = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = url.split('/').next()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

impl FetchDocumentTool {
    pub fn new(config: &FetchSection) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("hive/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains: config
                .allowed_domains
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            max_result_chars: config.max_result_chars,
            url_template: config.document_url_template.clone(),
        }
    }

    fn is_allowed(&self, url: &str) -> Result<(), String> {
        let domain = extract_domain(url).ok_or_else(|| "Invalid or missing URL".to_string())?;
        if self.allowed_domains.contains(&domain) {
            return Ok(());
        }
        Err(format!("Domain not in allowlist: {}", domain))
    }

    fn resolve_url(&self, args: &Value) -> Result<String, String> {
        if let Some(url) = args.get("url").and_then(|v| v.as_str()) {
            return Ok(url.trim().to_string());
        }
        let id = args
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "Missing id or url".to_string())?;
        let template = self
            .url_template
            .as_ref()
            .ok_or_else(|| "No document_url_template configured; pass url".to_string())?;
        Ok(template.replace("{id}", id))
    }

    async fn fetch(&self, url: &str) -> Result<(String, bool), String> {
        self.is_allowed(url)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| format!("Read body: {}", e))?;
        let body = body.strip_prefix('\u{FEFF}').unwrap_or(&body);

        let body = if looks_like_html(body) {
            match from_read(body.as_bytes(), 120) {
                Ok(text) if !text.trim().is_empty() => text,
                _ => strip_html_tags(body),
            }
        } else {
            body.to_string()
        };

        if body.chars().count() > self.max_result_chars {
            Ok((body.chars().take(self.max_result_chars).collect(), true))
        } else {
            Ok((body, false))
        }
    }
}

#[async_trait]
impl Tool for FetchDocumentTool {
    fn name(&self) -> &str {
        "fetchDocument"
    }

    fn description(&self) -> &str {
        "Fetch a document by id (via the configured document URL template) or by url (domain allowlist). Args: {\"id\": \"EP1234567\"} or {\"url\": \"https://...\"}. Returns {\"id\", \"url\", \"content\", \"truncated\"}."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string", "minLength": 1 },
                "url": { "type": "string", "pattern": "^https?://" }
            },
            "anyOf": [ { "required": ["id"] }, { "required": ["url"] } ]
        })
    }

    fn output_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "content": { "type": "string" },
                "truncated": { "type": "boolean" }
            },
            "required": ["url", "content", "truncated"]
        }))
    }

    fn capabilities(&self) -> Vec<String> {
        vec![capability::NETWORK.to_string()]
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, String> {
        let url = self.resolve_url(&args)?;
        tracing::info!(url = %url, "fetch document");
        let (content, truncated) = self.fetch(&url).await?;
        Ok(json!({
            "id": args.get("id").cloned().unwrap_or(Value::Null),
            "url": url,
            "content": content,
            "truncated": truncated,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(domains: &[&str], template: Option<&str>) -> FetchDocumentTool {
        FetchDocumentTool::new(&FetchSection {
            timeout_secs: 5,
            max_result_chars: 100,
            allowed_domains: domains.iter().map(|s| s.to_string()).collect(),
            document_url_template: template.map(String::from),
        })
    }

    #[test]
    fn test_domain_extraction() {
        assert_eq!(
            extract_domain("https://Example.org:8443/a/b"),
            Some("example.org".to_string())
        );
        assert_eq!(extract_domain("ftp://x"), None);
        assert_eq!(extract_domain("http:///path"), None);
    }

    #[test]
    fn test_allowlist() {
        let t = tool(&["patents.example.com"], None);
        assert!(t.is_allowed("https://patents.example.com/EP1").is_ok());
        assert!(t.is_allowed("https://evil.example.com/EP1").is_err());
    }

    #[test]
    fn test_url_from_id_template() {
        let t = tool(&[], Some("https://patents.example.com/doc/{id}.txt"));
        assert_eq!(
            t.resolve_url(&json!({"id": "EP1234567"})).unwrap(),
            "https://patents.example.com/doc/EP1234567.txt"
        );
        assert!(tool(&[], None).resolve_url(&json!({"id": "x"})).is_err());
    }

    #[test]
    fn test_html_detection_and_strip() {
        assert!(looks_like_html("<!DOCTYPE html><html></html>"));
        assert!(!looks_like_html("plain claim text"));
        assert_eq!(strip_html_tags("<p>a  <b>b</b></p>"), "a b");
    }
}
