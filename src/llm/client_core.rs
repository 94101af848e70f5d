use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::LlmConfig;
use crate::llm::ChatAgent;
use crate::llm::types::{AssistantTurn, ChatMessage, ToolDef};

mod network;

#[derive(Debug, Clone)]
pub struct OpenAIClient {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub(crate) inner: reqwest::Client,
    pub llm_cfg: LlmConfig,
    /// Total tokens reported by the last response
    pub tokens_used: Arc<AtomicU32>,
}

impl OpenAIClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .build()
            .context("build http client")?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            inner,
            llm_cfg: LlmConfig::default(),
            tokens_used: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn with_llm_config(mut self, cfg: LlmConfig) -> Self {
        let builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms));
        // Keep the default client if the builder rejects the settings.
        if let Ok(c) = builder.build() {
            self.inner = c;
        }
        self.llm_cfg = cfg;
        self
    }

    pub(crate) fn endpoint(&self) -> String {
        let mut base = self.base_url.trim_end_matches('/').to_string();
        if let Some(pos) = base.rfind("/v1") {
            base.truncate(pos);
            base = base.trim_end_matches('/').to_string();
        }
        format!("{base}/v1/chat/completions")
    }

    pub fn get_tokens_used(&self) -> u32 {
        self.tokens_used.load(Ordering::Relaxed)
    }

    pub(crate) fn set_tokens(&self, tokens: u32) {
        self.tokens_used.store(tokens, Ordering::Relaxed);
    }

    pub(crate) fn backoff_delay(&self, attempt: usize, retry_after_secs: Option<u64>) -> Duration {
        if self.llm_cfg.respect_retry_after
            && let Some(secs) = retry_after_secs
        {
            return Duration::from_secs(secs);
        }
        let base = self.llm_cfg.retry_base_ms;
        let shift = (attempt.max(1) - 1).min(16) as u32;
        let exp = base.saturating_mul(1u64 << shift);
        let jitter = self.llm_cfg.retry_jitter_ms as i64;
        let half = jitter / 2;
        let rnd = fastrand::i64(-half..=half).max(0) as u64;
        Duration::from_millis(exp.saturating_add(rnd))
    }
}

#[async_trait]
impl ChatAgent for OpenAIClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        cancel: &CancellationToken,
    ) -> Result<AssistantTurn> {
        let msg = network::chat_tools_once(self, messages.to_vec(), tools, cancel).await?;
        Ok(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmErrorKind, classify_error};
    use httptest::{Expectation, Server, matchers::*, responders::*};

    fn fast_cfg(max_retries: usize) -> LlmConfig {
        LlmConfig {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 5_000,
            max_retries,
            retry_base_ms: 1,
            retry_jitter_ms: 0,
            respect_retry_after: true,
        }
    }

    fn hi() -> Vec<ChatMessage> {
        vec![ChatMessage::user("hi")]
    }

    #[tokio::test]
    async fn complete_happy_path_with_tool_call() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/v1/chat/completions"),
                request::headers(contains(key("authorization"))),
            ])
            .respond_with(json_encoded(serde_json::json!({
                "id": "test",
                "choices": [{
                    "index": 0,
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "execute_bash", "arguments": "{\"command\":\"ls\"}"}
                        }]
                    }
                }],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            }))),
        );

        let client = OpenAIClient::new(server.url_str("/"), "test-key", "gpt-test").unwrap();
        let turn = client
            .complete(&hi(), &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(turn.content, None);
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].function.name, "execute_bash");
        assert_eq!(client.get_tokens_used(), 15);
    }

    #[tokio::test]
    async fn retries_on_500_then_succeeds() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
                .times(2)
                .respond_with(httptest::cycle![
                    status_code(500).append_header("Retry-After", "0").body("oops"),
                    json_encoded(serde_json::json!({
                        "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}}]
                    })),
                ]),
        );
        let client = OpenAIClient::new(server.url_str("/v1"), "x", "gpt")
            .unwrap()
            .with_llm_config(fast_cfg(1));
        let turn = client
            .complete(&hi(), &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(turn.content.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
                .times(1)
                .respond_with(status_code(400).body("bad")),
        );
        let client = OpenAIClient::new(server.url_str("/"), "x", "gpt")
            .unwrap()
            .with_llm_config(fast_cfg(3));
        let err = client
            .complete(&hi(), &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("400"));
        assert_eq!(classify_error(None, &err), LlmErrorKind::Client);
    }

    #[tokio::test]
    async fn exhausted_retries_report_last_kind() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
                .times(3)
                .respond_with(status_code(503).body("down")),
        );
        let client = OpenAIClient::new(server.url_str("/"), "x", "gpt")
            .unwrap()
            .with_llm_config(fast_cfg(2));
        let err = client
            .complete(&hi(), &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(classify_error(None, &err), LlmErrorKind::Server);
    }

    #[tokio::test]
    async fn cancelled_before_send() {
        let client = OpenAIClient::new("http://127.0.0.1:9/", "x", "gpt").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client.complete(&hi(), &[], &cancel).await.unwrap_err();
        assert_eq!(classify_error(None, &err), LlmErrorKind::Cancelled);
    }

    #[test]
    fn endpoint_normalization() {
        let c = OpenAIClient::new("https://api.example.com/v1/", "x", "m").unwrap();
        assert_eq!(c.endpoint(), "https://api.example.com/v1/chat/completions");
        let c2 = OpenAIClient::new("https://api.example.com/", "x", "m").unwrap();
        assert_eq!(c2.endpoint(), "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn backoff_doubles_and_honours_retry_after() {
        let c = OpenAIClient::new("https://api.example.com/", "x", "m")
            .unwrap()
            .with_llm_config(LlmConfig {
                retry_base_ms: 100,
                retry_jitter_ms: 0,
                respect_retry_after: true,
                ..LlmConfig::default()
            });
        assert_eq!(c.backoff_delay(1, None), Duration::from_millis(100));
        assert_eq!(c.backoff_delay(3, None), Duration::from_millis(400));
        assert_eq!(c.backoff_delay(3, Some(2)), Duration::from_secs(2));
    }
}
