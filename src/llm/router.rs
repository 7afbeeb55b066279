//! HTTP client for the external LLM gateway
//!
//! Speaks the OpenAI-compatible `/v1/chat/completions` shape the gateway
//! exposes. When the router is disabled the first configured node URL is used
//! directly; the request format is identical. Vision calls embed the
//! screenshot as a base64 data URL in the message content.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::{ChatMessage, LlmOptions, Role, TextLlm, VisionLlm};
use crate::config::NervaConfig;
use crate::error::{NervaError, Result};

/// Default per-call timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct RouterClient {
    http: Client,
    base_url: String,
    default_model: String,
}

impl RouterClient {
    pub fn new(base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .user_agent("nerva/0.3")
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: default_model.into(),
        }
    }

    /// Pick endpoint and default model from config. `vision` selects the
    /// vision model default.
    pub fn from_config(config: &NervaConfig, vision: bool) -> Self {
        let base = if config.use_router {
            config.router_url.clone()
        } else {
            config
                .llm_nodes
                .first()
                .cloned()
                .unwrap_or_else(|| config.router_url.clone())
        };
        let model = if vision {
            config.vision_model.clone()
        } else {
            config.llm_model.clone()
        };
        Self::new(base, model)
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn model<'a>(&'a self, options: &'a LlmOptions) -> &'a str {
        options.model.as_deref().unwrap_or(&self.default_model)
    }

    async fn complete(&self, body: Value) -> Result<String> {
        let response = self
            .http
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NervaError::LlmTimeout {
                        timeout_ms: REQUEST_TIMEOUT.as_millis() as u64,
                    }
                } else {
                    NervaError::LlmUnavailable {
                        reason: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NervaError::LlmUnavailable {
                reason: format!("gateway returned {}: {}", status, super::snippet(&body)),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| NervaError::BadResponse {
                snippet: e.to_string(),
            })?;

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| NervaError::BadResponse {
                snippet: super::snippet(&payload.to_string()),
            })
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[async_trait]
impl TextLlm for RouterClient {
    fn name(&self) -> &str {
        "router"
    }

    #[instrument(skip(self, messages), fields(count = messages.len()))]
    async fn chat(&self, messages: &[ChatMessage], options: &LlmOptions) -> Result<String> {
        let payload_messages: Vec<Value> = messages
            .iter()
            .map(|m| json!({"role": role_str(m.role), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": self.model(options),
            "messages": payload_messages,
        });
        if let Some(max) = options.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }

        debug!(model = self.model(options), "chat request");
        self.complete(body).await
    }
}

#[async_trait]
impl VisionLlm for RouterClient {
    fn name(&self) -> &str {
        "router"
    }

    #[instrument(skip(self, image, prompt), fields(image_bytes = image.len()))]
    async fn analyze(&self, image: &[u8], prompt: &str, options: &LlmOptions) -> Result<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let data_url = format!("data:image/png;base64,{}", encoded);

        let body = json!({
            "model": self.model(options),
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": data_url}},
                ],
            }],
        });

        debug!(model = self.model(options), "vision request");
        self.complete(body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat_reply(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        }))
    }

    #[tokio::test]
    async fn chat_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(chat_reply("pong"))
            .mount(&server)
            .await;

        let client = RouterClient::new(server.uri(), "test-model");
        let reply = client
            .chat(&[ChatMessage::user("ping")], &LlmOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, "pong");
    }

    #[tokio::test]
    async fn model_override_per_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(chat_reply("ok"))
            .mount(&server)
            .await;

        let client = RouterClient::new(server.uri(), "default-model");
        client
            .chat(
                &[ChatMessage::user("x")],
                &LlmOptions::with_model("override-model"),
            )
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["model"], "override-model");
    }

    #[tokio::test]
    async fn gateway_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let client = RouterClient::new(server.uri(), "m");
        let err = client
            .chat(&[ChatMessage::user("x")], &LlmOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NervaError::LlmUnavailable { .. }));
    }

    #[tokio::test]
    async fn malformed_payload_is_bad_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let client = RouterClient::new(server.uri(), "m");
        let err = client
            .chat(&[ChatMessage::user("x")], &LlmOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NervaError::BadResponse { .. }));
    }

    #[tokio::test]
    async fn vision_request_embeds_data_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(chat_reply("a button"))
            .mount(&server)
            .await;

        let client = RouterClient::new(server.uri(), "vis-model");
        let reply = client
            .analyze(b"fakepng", "what do you see?", &LlmOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, "a button");

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        let url = body["messages"][0]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }
}
