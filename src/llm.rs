use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};

const REASONING_OPEN: &str = "<think>";
const REASONING_CLOSE: &str = "</think>";

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A chat completion: the response text plus the total token count
/// reported by the backend (0 when the backend reports none).
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    pub total_tokens: u64,
}

pub trait LlmClient: Send + Sync {
    /// Send an ordered message sequence and get the model's reply.
    fn chat(
        &self,
        messages: &[ChatMessage],
    ) -> impl std::future::Future<Output = Result<ChatReply>> + Send;
}

/// Drop everything up to and including the closing reasoning marker.
/// Reasoning models prepend a `<think>…</think>` block to their replies;
/// downstream parsing only ever wants what follows it.
pub fn strip_reasoning(text: &str) -> &str {
    if text.contains(REASONING_OPEN)
        && let Some(pos) = text.find(REASONING_CLOSE)
    {
        return text[pos + REASONING_CLOSE.len()..].trim();
    }
    text.trim()
}

/// Parse an LLM reply as a list of document indices.
///
/// Accepts, in order of preference:
/// 1. a bracketed integer list, optionally wrapped in a fenced code block
/// 2. a bare integer (wrapped into a one-element list)
/// 3. the first bracketed substring anywhere in the text
/// 4. a line that is itself a bracketed list
/// 5. every integer run in the text, as a last resort
///
/// Fails with [`Error::Parse`] only when all of the above fail.
pub fn parse_index_list(text: &str) -> Result<Vec<usize>> {
    let content = unwrap_code_fence(strip_reasoning(text));

    if let Some(indices) = parse_bracketed(content) {
        return Ok(indices);
    }

    if let Ok(n) = content.parse::<usize>() {
        return Ok(vec![n]);
    }

    let bracket_re = Regex::new(r"\[[^\[\]]*\]").unwrap();
    if let Some(m) = bracket_re.find(content)
        && let Some(indices) = parse_bracketed(m.as_str())
    {
        return Ok(indices);
    }

    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[')
            && line.ends_with(']')
            && let Some(indices) = parse_bracketed(line)
        {
            return Ok(indices);
        }
    }

    let digits_re = Regex::new(r"\d+").unwrap();
    let runs: Vec<usize> = digits_re
        .find_iter(content)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    if !runs.is_empty() {
        return Ok(runs);
    }

    Err(Error::Parse(format!(
        "no index list found in response: {content:?}"
    )))
}

/// Strip a surrounding ``` fence (with optional language tag) if present.
fn unwrap_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```")
        && let Some(end) = rest.rfind("```")
    {
        let inner = &rest[..end];
        return match inner.split_once('\n') {
            Some((_tag, body)) => body.trim(),
            None => inner.trim(),
        };
    }
    trimmed
}

/// Parse `[0, 1, 2]` (elements may be quoted digit strings). Returns
/// `None` for anything that is not a pure integer list.
fn parse_bracketed(text: &str) -> Option<Vec<usize>> {
    let inner = text.trim().strip_prefix('[')?.strip_suffix(']')?.trim();
    if inner.is_empty() {
        return Some(Vec::new());
    }
    let mut out = Vec::new();
    for part in inner.split(',') {
        let part = part.trim().trim_matches(|c| c == '\'' || c == '"');
        out.push(part.parse::<usize>().ok()?);
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP backend
// ---------------------------------------------------------------------------

/// Chat client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct HttpLlmClient {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpLlmClient {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    fn chat_blocking(&self, messages: &[ChatMessage]) -> Result<ChatReply> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });

        let mut backoff_ms = INITIAL_BACKOFF_MS;
        for attempt in 1..=MAX_RETRIES {
            match self
                .agent
                .post(&url)
                .set("Authorization", &format!("Bearer {}", self.api_key))
                .set("Content-Type", "application/json")
                .send_json(&body)
            {
                Ok(response) => {
                    let json: serde_json::Value = response
                        .into_json()
                        .map_err(|e| Error::Llm(format!("failed to parse chat response: {e}")))?;
                    return extract_reply(&json);
                }
                Err(ref e) if attempt < MAX_RETRIES && is_retryable(e) => {
                    warn!(attempt, error = %e, backoff_ms, "chat request failed, retrying");
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                    backoff_ms *= 2;
                }
                Err(e) => return Err(Error::Llm(format!("chat request failed: {e}"))),
            }
        }
        unreachable!("retry loop returns on final attempt")
    }
}

impl LlmClient for HttpLlmClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatReply> {
        let client = self.clone();
        let messages = messages.to_vec();
        tokio::task::spawn_blocking(move || client.chat_blocking(&messages))
            .await
            .map_err(|e| Error::Llm(format!("chat task failed: {e}")))?
    }
}

fn extract_reply(json: &serde_json::Value) -> Result<ChatReply> {
    let content = json["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| Error::Llm(format!("chat response missing content: {json}")))?
        .to_string();
    let total_tokens = json["usage"]["total_tokens"].as_u64().unwrap_or(0);
    Ok(ChatReply {
        content,
        total_tokens,
    })
}

fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
        ureq::Error::Transport(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_reasoning_removes_block() {
        let text = "<think>step by step</think>\nThe answer is 42";
        assert_eq!(strip_reasoning(text), "The answer is 42");
    }

    #[test]
    fn test_strip_reasoning_without_markers() {
        assert_eq!(strip_reasoning("  plain reply  "), "plain reply");
    }

    #[test]
    fn test_strip_reasoning_unclosed_marker_kept() {
        let text = "<think>never closed";
        assert_eq!(strip_reasoning(text), "<think>never closed");
    }

    #[test]
    fn test_parse_plain_list() {
        assert_eq!(parse_index_list("[0, 1, 2]").unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_parse_empty_list() {
        assert_eq!(parse_index_list("[]").unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn test_parse_quoted_digit_elements() {
        assert_eq!(parse_index_list("['0', \"2\"]").unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_parse_scalar_wrapped() {
        assert_eq!(parse_index_list("3").unwrap(), vec![3]);
    }

    #[test]
    fn test_parse_fenced_list() {
        assert_eq!(parse_index_list("```json\n[1, 2]\n```").unwrap(), vec![1, 2]);
        assert_eq!(parse_index_list("```\n[0]\n```").unwrap(), vec![0]);
    }

    #[test]
    fn test_parse_embedded_list() {
        let text = "The supporting documents are [0, 3] as requested.";
        assert_eq!(parse_index_list(text).unwrap(), vec![0, 3]);
    }

    #[test]
    fn test_parse_list_on_own_line() {
        let text = "Here you go:\n[1, 4]\nHope that helps.";
        assert_eq!(parse_index_list(text).unwrap(), vec![1, 4]);
    }

    #[test]
    fn test_parse_digit_run_fallback() {
        // No bracketed form anywhere; falls back to extracting integer runs.
        let text = "Here are the supporting docs: 0, 2";
        assert_eq!(parse_index_list(text).unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_parse_after_reasoning_block() {
        let text = "<think>hmm 99</think>[1]";
        assert_eq!(parse_index_list(text).unwrap(), vec![1]);
    }

    #[test]
    fn test_parse_failure_when_no_digits() {
        let err = parse_index_list("none of the documents apply").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_parse_canonical_roundtrip() {
        let list = vec![0, 1, 2, 10];
        let rendered = format!(
            "[{}]",
            list.iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        assert_eq!(parse_index_list(&rendered).unwrap(), list);
    }

    #[test]
    fn test_extract_reply_with_usage() {
        let json = serde_json::json!({
            "choices": [{"message": {"content": "hello"}}],
            "usage": {"total_tokens": 17},
        });
        let reply = extract_reply(&json).unwrap();
        assert_eq!(reply.content, "hello");
        assert_eq!(reply.total_tokens, 17);
    }

    #[test]
    fn test_extract_reply_missing_content() {
        let json = serde_json::json!({"choices": []});
        assert!(extract_reply(&json).is_err());
    }
}
