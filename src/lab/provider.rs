//! Model-provider capability and the registry that routes calls to it.
//!
//! A [`ModelProvider`] is a wrapper around one remote LLM service. It does not remember
//! anything between calls: the [`ConversationEngine`](crate::lab::protocol::ConversationEngine)
//! rebuilds the full prompt for every turn and hands it over as a list of [`Message`]s.

use crate::lab::config::LabConfig;
use crate::lab::error::LabError;
use crate::lab::experiment::ModelRef;
use crate::lab::providers::openai_compatible::OpenAICompatibleProvider;
use crate::lab::providers::rate_limited::{RateLimitedProvider, RetryPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Represents the possible roles for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message sent to a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
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
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// One chat-completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Provider-specific model id (already resolved from the provider default if needed).
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
}

/// The text a model returned, plus usage when the provider reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
        }
    }
}

/// A failed provider call. `retryable` marks transient conditions (rate limits, timeouts,
/// 5xx) that [`RateLimitedProvider`] may retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub retryable: bool,
    pub message: String,
}

impl ProviderError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ProviderError {}

/// Trait implemented by every model backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Model used when a [`ModelRef`] leaves the model unspecified.
    fn default_model(&self) -> &str;

    /// Send the messages and return the model's reply.
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError>;
}

/// Providers keyed by id.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configuration: every provider whose API key environment
    /// variable is set gets an OpenAI-compatible client behind its configured rate limit.
    /// Providers without a key are skipped with a log line.
    pub fn from_config(config: &LabConfig) -> Self {
        let mut registry = ProviderRegistry::new();
        for settings in &config.providers {
            let Some(key) = settings.api_key() else {
                log::info!(
                    "provider '{}' not registered: {} is not set",
                    settings.id,
                    settings.api_key_env
                );
                continue;
            };
            let client = OpenAICompatibleProvider::new(
                &key,
                &settings.base_url,
                &settings.default_model,
            )
            .with_url_path(&settings.url_path);
            let limited =
                RateLimitedProvider::new(client, settings.rpm_limit, RetryPolicy::default());
            // ids in LabConfig are unique after validate(); a duplicate would be skipped here.
            if let Err(e) = registry.register(&settings.id, Arc::new(limited)) {
                log::warn!("{}", e);
            }
        }
        registry
    }

    /// Register `provider` under `id`. Fails if the id is taken.
    pub fn register(
        &mut self,
        id: &str,
        provider: Arc<dyn ModelProvider>,
    ) -> Result<(), LabError> {
        if self.providers.contains_key(id) {
            return Err(LabError::DuplicateRegistration {
                kind: "provider",
                id: id.to_string(),
            });
        }
        self.providers.insert(id.to_string(), provider);
        Ok(())
    }

    pub fn with_provider(
        mut self,
        id: &str,
        provider: Arc<dyn ModelProvider>,
    ) -> Result<Self, LabError> {
        self.register(id, provider)?;
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Send `messages` to the model named by `model` and return the reply text.
    pub async fn call_model(
        &self,
        model: &ModelRef,
        messages: Vec<Message>,
        temperature: f32,
    ) -> Result<String, ProviderError> {
        let provider = self.get(&model.provider).ok_or_else(|| {
            ProviderError::fatal(format!("unknown provider '{}'", model.provider))
        })?;
        let model_id = model
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string());
        let completion = provider
            .complete(CompletionRequest {
                model: model_id,
                messages,
                temperature,
            })
            .await?;
        Ok(completion.content)
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}
