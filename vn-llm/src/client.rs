use crate::anthropic::AnthropicClient;
use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{ChatMessage, ChatResponse};

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, model: &str) -> Self {
        let provider = detect_provider(model);
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            provider,
            api_key: api_key.to_string(),
            model: model.to_string(),
            client,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput(
                "chat requires at least one message".to_string(),
            ));
        }
        match self.provider {
            Provider::OpenAI => {
                OpenAiClient::new(self.client.clone(), &self.api_key, &self.model)
                    .chat(messages)
                    .await
            }
            Provider::Anthropic => {
                AnthropicClient::new(self.client.clone(), &self.api_key, &self.model)
                    .chat(messages)
                    .await
            }
        }
    }

    /// One system prompt, one user turn, trimmed text back.
    pub async fn complete(&self, system_prompt: &str, user_message: &str) -> Result<String> {
        let response = self
            .chat(&[
                ChatMessage::system(system_prompt),
                ChatMessage::user(user_message),
            ])
            .await?;
        tracing::debug!(
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            finish_reason = %response.finish_reason,
            "llm completion finished"
        );
        Ok(response.message.content.trim().to_string())
    }
}

fn detect_provider(model: &str) -> Provider {
    let m = model.to_ascii_lowercase();
    if m.starts_with("claude-") {
        return Provider::Anthropic;
    }
    Provider::OpenAI
}
