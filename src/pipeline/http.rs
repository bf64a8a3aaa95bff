//! OpenAI-compatible chat completion client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{CompletionConfig, ModelTiers};
use crate::core::fallback::{Availability, AvailabilityProbe};

use super::services::{CompletionService, Prompt, PromptKind, ServiceError};

/// Calls `POST {base_url}/chat/completions`.
pub struct HttpCompletionService {
    client: reqwest::Client,
    base_url: String,
    models: ModelTiers,
    api_key: Option<String>,
    max_tokens: u32,
}

impl HttpCompletionService {
    pub fn new(config: &CompletionConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            models: config.models.clone(),
            api_key: config.api_key(),
            max_tokens: config.max_tokens,
        })
    }

    /// The model a prompt of this kind is sent to.
    pub fn model_for(&self, kind: PromptKind) -> &str {
        self.models.get(kind.tier())
    }

    fn api_key(&self) -> Result<&str, ServiceError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ServiceError::Unavailable("API key not set".into()))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
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
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl AvailabilityProbe for HttpCompletionService {
    fn backend(&self) -> &str {
        &self.base_url
    }

    async fn probe(&self) -> Availability {
        let key = match self.api_key() {
            Ok(key) => key,
            Err(err) => return Availability::Unavailable(err.to_string()),
        };
        let url = format!("{}/models", self.base_url);
        match self.client.get(&url).bearer_auth(key).send().await {
            Ok(response) if response.status().is_success() => Availability::Available,
            Ok(response) => {
                Availability::Unavailable(format!("models endpoint returned {}", response.status()))
            }
            Err(err) => Availability::Unavailable(err.to_string()),
        }
    }
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    async fn generate(&self, prompt: &Prompt) -> Result<String, ServiceError> {
        let key = self.api_key()?;
        let model = self.model_for(prompt.kind);
        let request = ChatRequest {
            model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            max_tokens: prompt.max_tokens.unwrap_or(self.max_tokens),
            temperature: 0.1,
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %model, kind = ?prompt.kind, "sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let reply: ChatResponse = response.json().await?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ServiceError::InvalidResponse("no completion choices".into()))?;
        Ok(content.trim().to_string())
    }
}
