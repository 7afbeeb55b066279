//! LLM client abstraction
//!
//! The core consumes two narrow contracts: [`TextLlm::chat`] over role-tagged
//! messages and [`VisionLlm::analyze`] over an image plus prompt. Both return
//! free-form strings; whenever a response is used as a control signal (router
//! tag, vision action JSON) it goes through the strict → lenient →
//! retry-with-clarifier ladder in this module. Prose is never accepted as a
//! control signal.
//!
//! Production traffic goes through [`RouterClient`](router::RouterClient)
//! against the external gateway; tests and `--offline` use the scripted
//! mocks in [`mock`].

pub mod mock;
pub mod router;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::NervaConfig;
use crate::error::{NervaError, Result};

/// Instruction appended when the first JSON parse fails.
pub const STRICT_JSON_CLARIFIER: &str =
    "Respond with strict JSON only: a single JSON object, no prose, no code fences.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call options; `model` overrides the client default.
#[derive(Debug, Clone, Default)]
pub struct LlmOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl LlmOptions {
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Default::default()
        }
    }
}

/// Text chat contract
#[async_trait]
pub trait TextLlm: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, messages: &[ChatMessage], options: &LlmOptions) -> Result<String>;
}

/// Vision analysis contract
#[async_trait]
pub trait VisionLlm: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, image: &[u8], prompt: &str, options: &LlmOptions) -> Result<String>;
}

/// Build the production text client from config.
pub fn create_text_llm(config: &NervaConfig) -> std::sync::Arc<dyn TextLlm> {
    std::sync::Arc::new(router::RouterClient::from_config(config, false))
}

/// Build the production vision client from config.
pub fn create_vision_llm(config: &NervaConfig) -> std::sync::Arc<dyn VisionLlm> {
    std::sync::Arc::new(router::RouterClient::from_config(config, true))
}

/// Lenient JSON extraction: strict parse, then fenced-block strip, then the
/// first balanced object in the text.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    // ```json ... ``` fences
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(rest[..end].trim()) {
                if value.is_object() {
                    return Some(value);
                }
            }
        }
    }

    // First balanced top-level object, string-aware.
    let bytes = trimmed.as_bytes();
    let start = trimmed.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&trimmed[start..=i]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Ask for a JSON object, retrying once with the strict clarifier before
/// giving up with `BadResponse`.
pub async fn chat_json(
    llm: &dyn TextLlm,
    messages: &[ChatMessage],
    options: &LlmOptions,
) -> Result<Value> {
    let first = llm.chat(messages, options).await?;
    if let Some(value) = extract_json(&first) {
        return Ok(value);
    }

    let mut retry: Vec<ChatMessage> = messages.to_vec();
    retry.push(ChatMessage::assistant(first));
    retry.push(ChatMessage::user(STRICT_JSON_CLARIFIER));

    let second = llm.chat(&retry, options).await?;
    extract_json(&second).ok_or_else(|| NervaError::BadResponse {
        snippet: snippet(&second),
    })
}

/// First 120 chars of a bad response, for error messages.
pub(crate) fn snippet(text: &str) -> String {
    let mut s: String = text.chars().take(120).collect();
    if text.chars().count() > 120 {
        s.push('…');
    }
    s
}
