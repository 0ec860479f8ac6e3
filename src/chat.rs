use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::trace::Span;

// Fixed prefix some tuned model replies carry; stripped before display.
pub const BOT_REPLY_PREFIX: &str = "Fine-Tuned LIU ChatBot:";

pub const GENERIC_CHAT_ERROR: &str = "Sorry, I encountered an error. Please try again.";

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct ChatCompletionError {
    pub message: String,
}

impl ChatCompletionError {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.trim().is_empty() {
            return Self {
                message: GENERIC_CHAT_ERROR.to_string(),
            };
        }
        Self { message }
    }
}

impl std::fmt::Display for ChatCompletionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ChatCompletionError {}

#[derive(Debug, Deserialize)]
struct ChatResp {
    response: Option<String>,
}

fn strip_markup(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for ch in s.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

fn strip_bot_prefix(s: &str) -> &str {
    match s.get(..BOT_REPLY_PREFIX.len()) {
        Some(head) if head.eq_ignore_ascii_case(BOT_REPLY_PREFIX) => {
            s[BOT_REPLY_PREFIX.len()..].trim_start()
        }
        _ => s,
    }
}

pub fn sanitize_response(raw: &str) -> String {
    let without_tags = strip_markup(raw);
    strip_bot_prefix(without_tags.trim()).to_string()
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let head: String = s.chars().take(max_chars).collect();
    format!("{head}...(truncated)")
}

fn error_from_body(status: reqwest::StatusCode, body: &str) -> ChatCompletionError {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = v.get("error").and_then(|e| e.as_str()) {
            if !msg.trim().is_empty() {
                return ChatCompletionError::new(msg);
            }
        }
    }
    if !body.trim().is_empty() {
        return ChatCompletionError::new(format!(
            "chat http {status}: {}",
            truncate_chars(body, MAX_ERROR_BODY_CHARS)
        ));
    }
    ChatCompletionError::new(format!("chat http {status}"))
}

#[async_trait]
pub trait CompletionApi: Send + Sync {
    async fn complete(&self, text: &str) -> Result<String, ChatCompletionError>;
}

pub struct HttpCompletionApi {
    client: Client,
    api_base: String,
    data_dir: PathBuf,
    session_id: String,
}

impl HttpCompletionApi {
    pub fn new(client: Client, api_base: String, data_dir: PathBuf, session_id: String) -> Self {
        Self {
            client,
            api_base,
            data_dir,
            session_id,
        }
    }
}

#[async_trait]
impl CompletionApi for HttpCompletionApi {
    async fn complete(&self, text: &str) -> Result<String, ChatCompletionError> {
        let span = Span::start(
            &self.data_dir,
            Some(&self.session_id),
            "Chat",
            "CHAT.complete",
            Some(serde_json::json!({ "msg_chars": text.chars().count() })),
        );

        let out = self.complete_inner(text).await;
        match &out {
            Ok(v) => span.ok(Some(serde_json::json!({ "response_chars": v.chars().count() }))),
            Err(e) => span.err("http", "E_CHAT_COMPLETION", &e.message, None),
        }
        out
    }
}

impl HttpCompletionApi {
    async fn complete_inner(&self, text: &str) -> Result<String, ChatCompletionError> {
        let url = format!("{}/tuning-chat", self.api_base);
        let resp = self
            .client
            .post(url)
            .query(&[("msg", text)])
            .send()
            .await
            .map_err(|e| ChatCompletionError::new(format!("chat request failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ChatCompletionError::new(format!("chat read response failed: {e}")))?;

        if !status.is_success() {
            return Err(error_from_body(status, &body));
        }

        let parsed: ChatResp = serde_json::from_str(&body)
            .map_err(|e| ChatCompletionError::new(format!("chat invalid json response: {e}")))?;
        let content = parsed.response.unwrap_or_default();
        if content.trim().is_empty() {
            return Err(ChatCompletionError::new("chat returned empty response"));
        }
        Ok(content)
    }
}
