//! Mock LLM clients for testing
//!
//! Return scripted responses without network calls and record every request
//! for assertions. The queue is FIFO; when it runs dry the default response
//! is returned forever.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ChatMessage, LlmOptions, TextLlm, VisionLlm};
use crate::error::{NervaError, Result};

/// Scripted text LLM
#[derive(Clone)]
pub struct MockTextLlm {
    responses: Arc<Mutex<Vec<String>>>,
    default_response: String,
    requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    fail_with_unavailable: Arc<Mutex<bool>>,
}

impl MockTextLlm {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            default_response: "mock response".to_string(),
            requests: Arc::new(Mutex::new(Vec::new())),
            fail_with_unavailable: Arc::new(Mutex::new(false)),
        }
    }

    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        *mock.responses.lock().unwrap() = responses.into_iter().map(Into::into).collect();
        mock
    }

    pub fn with_default(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    pub fn queue_response(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push(response.into());
    }

    /// Make every subsequent call fail with `LlmUnavailable`.
    pub fn go_offline(&self) {
        *self.fail_with_unavailable.lock().unwrap() = true;
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<Vec<ChatMessage>> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }

    fn next_response(&self) -> String {
        let mut queue = self.responses.lock().unwrap();
        if queue.is_empty() {
            self.default_response.clone()
        } else {
            queue.remove(0)
        }
    }
}

impl Default for MockTextLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextLlm for MockTextLlm {
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(&self, messages: &[ChatMessage], _options: &LlmOptions) -> Result<String> {
        self.requests.lock().unwrap().push(messages.to_vec());
        if *self.fail_with_unavailable.lock().unwrap() {
            return Err(NervaError::LlmUnavailable {
                reason: "mock offline".to_string(),
            });
        }
        Ok(self.next_response())
    }
}

/// Scripted vision LLM
#[derive(Clone)]
pub struct MockVisionLlm {
    responses: Arc<Mutex<Vec<String>>>,
    default_response: String,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl MockVisionLlm {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            default_response: r#"{"kind": "complete", "rationale": "mock done"}"#.to_string(),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        *mock.responses.lock().unwrap() = responses.into_iter().map(Into::into).collect();
        mock
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Default for MockVisionLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VisionLlm for MockVisionLlm {
    fn name(&self) -> &str {
        "mock"
    }

    async fn analyze(&self, _image: &[u8], prompt: &str, _options: &LlmOptions) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut queue = self.responses.lock().unwrap();
        Ok(if queue.is_empty() {
            self.default_response.clone()
        } else {
            queue.remove(0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_responses_in_order() {
        let llm = MockTextLlm::with_responses(["one", "two"]);
        let options = LlmOptions::default();

        assert_eq!(
            llm.chat(&[ChatMessage::user("a")], &options).await.unwrap(),
            "one"
        );
        assert_eq!(
            llm.chat(&[ChatMessage::user("b")], &options).await.unwrap(),
            "two"
        );
        // Queue exhausted: default
        assert_eq!(
            llm.chat(&[ChatMessage::user("c")], &options).await.unwrap(),
            "mock response"
        );
        assert_eq!(llm.request_count(), 3);
    }

    #[tokio::test]
    async fn offline_mode_fails() {
        let llm = MockTextLlm::new();
        llm.go_offline();
        let err = llm
            .chat(&[ChatMessage::user("x")], &LlmOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NervaError::LlmUnavailable { .. }));
    }

    #[tokio::test]
    async fn vision_records_prompts() {
        let llm = MockVisionLlm::with_responses([r#"{"kind": "wait"}"#]);
        let reply = llm
            .analyze(b"img", "describe", &LlmOptions::default())
            .await
            .unwrap();
        assert!(reply.contains("wait"));
        assert_eq!(llm.prompts(), vec!["describe"]);
    }
}
