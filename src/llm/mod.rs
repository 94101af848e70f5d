mod client_core;
#[cfg(test)]
pub mod scripted;
pub mod types;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

pub use client_core::*;
pub use types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LlmErrorKind {
    #[error("rate limited")]
    RateLimited,
    #[error("server error")]
    Server,
    #[error("network error")]
    Network,
    #[error("request timed out")]
    Timeout,
    #[error("client error")]
    Client,
    #[error("malformed response")]
    Deserialize,
    #[error("request cancelled")]
    Cancelled,
    #[error("unknown error")]
    Unknown,
}

impl LlmErrorKind {
    /// Worth another attempt with the same request.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited
                | LlmErrorKind::Server
                | LlmErrorKind::Network
                | LlmErrorKind::Timeout
        )
    }
}

pub fn classify_error(status: Option<StatusCode>, err: &anyhow::Error) -> LlmErrorKind {
    if let Some(st) = status {
        if st == StatusCode::TOO_MANY_REQUESTS {
            return LlmErrorKind::RateLimited;
        }
        if st == StatusCode::REQUEST_TIMEOUT {
            return LlmErrorKind::Timeout;
        }
        if st.is_server_error() {
            return LlmErrorKind::Server;
        }
        if st.is_client_error() {
            return LlmErrorKind::Client;
        }
    }
    if let Some(kind) = err.downcast_ref::<LlmErrorKind>() {
        return *kind;
    }
    if let Some(e) = err.downcast_ref::<reqwest::Error>() {
        if e.is_timeout() {
            return LlmErrorKind::Timeout;
        }
        if e.is_connect() || e.is_body() || e.is_request() {
            return LlmErrorKind::Network;
        }
        if e.is_decode() {
            return LlmErrorKind::Deserialize;
        }
    }
    LlmErrorKind::Unknown
}

/// The chat-completion collaborator: one model turn over the given history.
///
/// Implementations must return promptly with [`LlmErrorKind::Cancelled`]
/// once `cancel` fires.
#[async_trait]
pub trait ChatAgent: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        cancel: &CancellationToken,
    ) -> anyhow::Result<AssistantTurn>;
}
