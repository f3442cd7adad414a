use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::registry::ProviderConfig;

pub const DEFAULT_PROMPT: &str = "Summarize the following video transcript. \
Keep the key points, names and conclusions, and answer in the language of \
the transcript.";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("timed out")]
    Timeout,
    #[error("authentication rejected")]
    Auth,
    #[error("rate limited upstream")]
    RateLimited,
    #[error("api error {status}: {detail}")]
    Api { status: u16, detail: String },
    #[error("network: {0}")]
    Network(#[from] reqwest::Error),
    #[error("empty completion")]
    Empty,
}

impl ProviderError {
    /// Transient dispatch failures get retried; a bad key never fixes
    /// itself, so it does not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::RateLimited | ProviderError::Network(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::Auth | ProviderError::Empty => false,
        }
    }
}

/// One summarization backend. Implementations are uniform: a name, a
/// pacing hint and a dispatch, nothing else leaks out.
#[async_trait]
pub trait SummaryProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Seconds to keep between consecutive dispatches to this backend.
    fn min_interval(&self) -> f64 {
        0.0
    }

    async fn dispatch(&self, transcript: &str) -> Result<String, ProviderError>;
}

/// OpenAI-style chat backend. Every provider we talk to (deepseek,
/// kimi, qwen, glm, openai itself) speaks this same protocol under a
/// different base_url, so one implementation covers the registry.
pub struct ChatProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl ChatProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[async_trait]
impl SummaryProvider for ChatProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn min_interval(&self) -> f64 {
        self.config.min_interval
    }

    async fn dispatch(&self, transcript: &str) -> Result<String, ProviderError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let prompt = self.config.prompt.as_deref().unwrap_or(DEFAULT_PROMPT);
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: prompt,
                },
                ChatMessage {
                    role: "user",
                    content: transcript,
                },
            ],
        };

        debug!(
            "dispatching {} chars to {} ({})",
            transcript.len(),
            self.config.name,
            self.config.model
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        match resp.status().as_u16() {
            200 => {}
            401 | 403 => return Err(ProviderError::Auth),
            429 => return Err(ProviderError::RateLimited),
            status => {
                let detail: String = resp.text().await.unwrap_or_default().chars().take(300).collect();
                return Err(ProviderError::Api { status, detail });
            }
        }

        let parsed: ChatResponse = resp.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(ProviderError::Empty);
        }
        Ok(text.trim().to_string())
    }
}
