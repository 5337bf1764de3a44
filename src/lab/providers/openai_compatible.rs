//! Provider for endpoints that implement the OpenAI chat-completions protocol.
//!
//! ```rust,no_run
//! use cloudllm_lab::providers::openai_compatible::OpenAICompatibleProvider;
//!
//! let together = OpenAICompatibleProvider::new(
//!     &std::env::var("TOGETHER_API_KEY").unwrap_or_default(),
//!     "https://api.together.xyz",
//!     "lgai/exaone-3-5-32b-instruct",
//! );
//! ```

use crate::lab::provider::{
    Completion, CompletionRequest, ModelProvider, ProviderError, Role, TokenUsage,
};
use crate::lab::providers::http_pool::get_http_client;
use async_trait::async_trait;
use openai_rust::chat;
use openai_rust2 as openai_rust;

/// Path used unless [`OpenAICompatibleProvider::with_url_path`] says otherwise.
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// A client for one OpenAI-compatible base URL.
pub struct OpenAICompatibleProvider {
    client: openai_rust::Client,
    base_url: String,
    default_model: String,
    url_path: String,
}

impl OpenAICompatibleProvider {
    pub fn new(secret_key: &str, base_url: &str, default_model: &str) -> Self {
        OpenAICompatibleProvider {
            client: openai_rust::Client::new_with_client_and_base_url(
                secret_key,
                get_http_client(base_url),
                base_url,
            ),
            base_url: base_url.to_string(),
            default_model: default_model.to_string(),
            url_path: CHAT_COMPLETIONS_PATH.to_string(),
        }
    }

    /// Override the request path for services that mount chat-completions elsewhere
    /// (Gemini's compatibility layer lives under `/v1beta/openai/chat/completions`).
    pub fn with_url_path(mut self, url_path: &str) -> Self {
        self.url_path = url_path.to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url_path(&self) -> &str {
        &self.url_path
    }
}

#[async_trait]
impl ModelProvider for OpenAICompatibleProvider {
    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        let formatted_messages: Vec<chat::Message> = request
            .messages
            .iter()
            .map(|msg| chat::Message {
                role: match msg.role {
                    Role::System => "system".to_owned(),
                    Role::User => "user".to_owned(),
                    Role::Assistant => "assistant".to_owned(),
                },
                content: msg.content.clone(),
            })
            .collect();

        let mut chat_arguments = chat::ChatArguments::new(&request.model, formatted_messages);
        chat_arguments.temperature = Some(request.temperature);

        match self
            .client
            .create_chat(chat_arguments, Some(self.url_path.clone()))
            .await
        {
            Ok(response) => {
                let usage = TokenUsage {
                    input_tokens: response.usage.prompt_tokens as usize,
                    output_tokens: response.usage.completion_tokens as usize,
                    total_tokens: response.usage.total_tokens as usize,
                };
                let content = response
                    .choices
                    .first()
                    .map(|choice| choice.message.content.clone())
                    .ok_or_else(|| {
                        ProviderError::retryable(format!(
                            "{} returned no choices for {}",
                            self.base_url, request.model
                        ))
                    })?;
                Ok(Completion {
                    content,
                    usage: Some(usage),
                })
            }
            Err(err) => {
                let message = err.to_string();
                log::error!(
                    "cloudllm_lab::providers::openai_compatible: {} error for {}: {}",
                    self.base_url,
                    request.model,
                    message
                );
                Err(classify_error(message))
            }
        }
    }
}

/// Map a transport/API error message onto a [`ProviderError`], flagging transient failures.
pub fn classify_error(message: String) -> ProviderError {
    const TRANSIENT: [&str; 10] = [
        "429",
        "rate limit",
        "rate_limit",
        "timed out",
        "timeout",
        "overloaded",
        "500",
        "502",
        "503",
        "connection",
    ];
    let lower = message.to_lowercase();
    if TRANSIENT.iter().any(|marker| lower.contains(marker)) {
        ProviderError::retryable(message)
    } else {
        ProviderError::fatal(message)
    }
}
