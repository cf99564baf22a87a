//! Session summarization over an Anthropic-style messages API

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Input is cut to this many characters before it is sent
pub const MAX_SUMMARY_INPUT_CHARS: usize = 120_000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const API_VERSION: &str = "2023-06-01";

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `text`. Any failure is `None`.
    async fn summarize(&self, title: &str, text: &str) -> Option<String>;
}

/// Keep the last `max` characters; the end of a transcript matters most
pub fn truncate_tail(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

pub struct HttpSummarizer {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    max_tokens: u32,
}

impl HttpSummarizer {
    pub fn new(
        url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        max_tokens: u32,
    ) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
            model: model.into(),
            api_key: api_key.into(),
            max_tokens,
        })
    }

    fn request_body(&self, title: &str, text: &str) -> Value {
        let prompt = format!(
            "Summarize this coding session in 2-4 sentences. Name the files and the outcome.\n\n# {}\n\n{}",
            title,
            truncate_tail(text, MAX_SUMMARY_INPUT_CHARS)
        );
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        })
    }

    async fn try_summarize(&self, title: &str, text: &str) -> Result<String, String> {
        let resp = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.request_body(title, text))
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("returned {}: {}", status, body.chars().take(200).collect::<String>()));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| format!("unreadable response: {}", e))?;
        extract_text(&body).ok_or_else(|| "response has no text content".to_string())
    }
}

/// Concatenated `text` blocks of a messages API response
fn extract_text(body: &Value) -> Option<String> {
    let text: Vec<&str> = body
        .get("content")?
        .as_array()?
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();
    let joined = text.join("\n").trim().to_string();
    (!joined.is_empty()).then_some(joined)
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, title: &str, text: &str) -> Option<String> {
        if text.trim().is_empty() {
            return None;
        }
        match self.try_summarize(title, text).await {
            Ok(summary) => {
                debug!(chars = summary.len(), "Summary generated");
                Some(summary)
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Summarizer failed");
                None
            }
        }
    }
}

/// Stand-in when no API key is configured
pub struct NoopSummarizer;

#[async_trait]
impl Summarizer for NoopSummarizer {
    async fn summarize(&self, _title: &str, _text: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_tail() {
        assert_eq!(truncate_tail("abcdef", 3), "def");
        assert_eq!(truncate_tail("abc", 10), "abc");
        assert_eq!(truncate_tail("日本語テキスト", 2), "スト");
    }

    #[test]
    fn test_request_body_caps_input() {
        let summarizer = HttpSummarizer::new("http://localhost", "m", "k", 256).unwrap();
        let long = "x".repeat(MAX_SUMMARY_INPUT_CHARS + 500);
        let body = summarizer.request_body("Session s1", &long);
        assert_eq!(body["max_tokens"], 256);
        let prompt = body["messages"][0]["content"].as_str().unwrap();
        assert!(prompt.contains("# Session s1"));
        assert!(prompt.len() < MAX_SUMMARY_INPUT_CHARS + 200);
    }

    #[test]
    fn test_extract_text() {
        let body = json!({"content": [
            {"type": "text", "text": "Fixed the cursor."},
            {"type": "tool_use", "id": "x"},
            {"type": "text", "text": "Added tests."}
        ]});
        assert_eq!(extract_text(&body).as_deref(), Some("Fixed the cursor.\nAdded tests."));
        assert!(extract_text(&json!({"content": []})).is_none());
        assert!(extract_text(&json!({"error": {"type": "overloaded"}})).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_none() {
        // port 9 (discard) on loopback refuses connections
        let summarizer = HttpSummarizer::new("http://127.0.0.1:9/v1/messages", "m", "k", 64).unwrap();
        assert!(summarizer.summarize("t", "some text").await.is_none());
        assert!(summarizer.summarize("t", "   ").await.is_none());
    }
}
