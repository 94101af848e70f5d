use anyhow::{Result, anyhow};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::OpenAIClient;
use crate::llm::types::{ChatMessage, ChatRequest, ChatResponse, ChoiceMessage, ToolDef};
use crate::llm::{LlmErrorKind, classify_error};

/// A failed attempt: what went wrong, whether the server asked us to wait.
struct AttemptError {
    kind: LlmErrorKind,
    retry_after: Option<u64>,
    err: anyhow::Error,
}

impl AttemptError {
    fn new(kind: LlmErrorKind, err: anyhow::Error) -> Self {
        Self {
            kind,
            retry_after: None,
            err: err.context(kind),
        }
    }
}

fn cancelled() -> anyhow::Error {
    anyhow::Error::new(LlmErrorKind::Cancelled)
}

pub async fn chat_tools_once(
    client: &OpenAIClient,
    messages: Vec<ChatMessage>,
    tools: &[ToolDef],
    cancel: &CancellationToken,
) -> Result<ChoiceMessage> {
    let url = client.endpoint();
    let req = ChatRequest {
        model: client.model.clone(),
        messages,
        temperature: None,
        tools: tools.to_vec(),
        tool_choice: if tools.is_empty() {
            None
        } else {
            Some("auto".into())
        },
    };

    let mut headers = HeaderMap::new();
    headers.insert("X-Title", HeaderValue::from_static("planwright"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let bearer = HeaderValue::from_str(&format!("Bearer {}", client.api_key))
        .map_err(|e| anyhow!("invalid api key header: {e}"))?;
    headers.insert(AUTHORIZATION, bearer);

    debug!(
        endpoint = %url,
        messages = req.messages.len(),
        tools = req.tools.len(),
        "sending chat.completions (tools) request"
    );

    let max_attempts = client.llm_cfg.max_retries.saturating_add(1);
    let mut last: Option<AttemptError> = None;

    for attempt in 1..=max_attempts {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("chat_tools_once cancelled");
                return Err(cancelled());
            }
            res = send_once(client, &url, &headers, &req) => res,
        };

        let failure = match outcome {
            Ok(msg) => return Ok(msg),
            Err(f) => f,
        };

        error!(attempt, kind = ?failure.kind, err = %failure.err, "llm chat attempt failed");
        if !failure.kind.is_retryable() || attempt >= max_attempts {
            return Err(failure.err);
        }

        let wait = client.backoff_delay(attempt, failure.retry_after);
        warn!(attempt, kind = ?failure.kind, wait_ms = %wait.as_millis(), "retrying chat_tools_once");
        last = Some(failure);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("chat_tools_once cancelled during retry sleep");
                return Err(cancelled());
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }

    Err(last
        .map(|f| f.err)
        .unwrap_or_else(|| anyhow!("chat request was never attempted")))
}

async fn send_once(
    client: &OpenAIClient,
    url: &str,
    headers: &HeaderMap,
    req: &ChatRequest,
) -> std::result::Result<ChoiceMessage, AttemptError> {
    let resp = client
        .inner
        .post(url)
        .headers(headers.clone())
        .json(req)
        .send()
        .await
        .map_err(|e| {
            let err = anyhow::Error::new(e).context("send chat request");
            AttemptError::new(classify_error(None, &err), err)
        })?;

    let status = resp.status();
    if !status.is_success() {
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let text = resp.text().await.unwrap_or_default();
        let err = anyhow!("chat error: {} - {}", status, text);
        let mut failure = AttemptError::new(classify_error(Some(status), &err), err);
        failure.retry_after = retry_after;
        return Err(failure);
    }

    let text = resp.text().await.map_err(|e| {
        let err = anyhow::Error::new(e).context("read chat response body");
        AttemptError::new(classify_error(None, &err), err)
    })?;

    let body: ChatResponse = serde_json::from_str(&text).map_err(|e| {
        AttemptError::new(
            LlmErrorKind::Deserialize,
            anyhow::Error::new(e).context("parse chat response"),
        )
    })?;

    if let Some(usage) = &body.usage {
        client.set_tokens(usage.total_tokens);
    }

    body.choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| AttemptError::new(LlmErrorKind::Deserialize, anyhow!("no choices returned")))
}
