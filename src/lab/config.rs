//! Runtime configuration for the experiment lab.
//!
//! [`LabConfig`] is a plain struct: build it by hand, start from [`LabConfig::default`], or
//! overlay environment variables with [`LabConfig::from_env`]. No config-file parser is
//! involved.
//!
//! ```rust
//! use cloudllm_lab::LabConfig;
//!
//! let config = LabConfig::default();
//! assert_eq!(config.max_concurrent_experiments, 3);
//! assert_eq!(config.default_priority, 5);
//! assert!(config.provider("together").is_some());
//! ```

use crate::lab::error::LabError;
use crate::lab::experiment::{ExperimentSpec, ExperimentType};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Item cap used when neither the configuration nor the environment sets one.
pub const DEFAULT_MAX_ITEMS_PER_EXPERIMENT: usize = 1000;

/// Connection settings for one OpenAI-compatible provider endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Registry key, e.g. `"openai"`.
    pub id: String,
    pub display_name: String,
    /// Base URL the chat-completions path is resolved against.
    pub base_url: String,
    /// Chat-completions path. An absolute path replaces whatever path `base_url` carries.
    pub url_path: String,
    /// Model used when a [`ModelRef`](crate::lab::experiment::ModelRef) names no model.
    pub default_model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Requests per minute allowed against this provider.
    pub rpm_limit: u32,
}

impl ProviderSettings {
    fn stock(
        id: &str,
        display_name: &str,
        base_url: &str,
        url_path: &str,
        default_model: &str,
        api_key_env: &str,
        rpm_limit: u32,
    ) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            base_url: base_url.to_string(),
            url_path: url_path.to_string(),
            default_model: default_model.to_string(),
            api_key_env: api_key_env.to_string(),
            rpm_limit,
        }
    }

    /// The full chat-completions URL requests are sent to.
    pub fn endpoint(&self) -> Result<reqwest::Url, LabError> {
        reqwest::Url::parse(&self.base_url)
            .and_then(|base| base.join(&self.url_path))
            .map_err(|e| {
                LabError::Config(format!(
                    "provider '{}' has an invalid endpoint {} + {}: {}",
                    self.id, self.base_url, self.url_path, e
                ))
            })
    }

    /// Read this provider's API key from the environment.
    pub fn api_key(&self) -> Option<String> {
        env::var(&self.api_key_env).ok().filter(|k| !k.trim().is_empty())
    }
}

/// Lab-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabConfig {
    /// Upper bound on experiments in `running` state at any moment. Must be at least 1.
    pub max_concurrent_experiments: usize,
    /// Priority used by `submit` when the caller does not choose one.
    pub default_priority: i32,
    pub default_temperature: f32,
    pub default_turn_limit: usize,
    /// Hard cap on items loaded from a dataset, applied before a spec's own `item_limit`.
    pub max_items_per_experiment: usize,
    pub providers: Vec<ProviderSettings>,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            max_concurrent_experiments: 3,
            default_priority: 5,
            default_temperature: 0.7,
            default_turn_limit: 3,
            max_items_per_experiment: DEFAULT_MAX_ITEMS_PER_EXPERIMENT,
            providers: vec![
                ProviderSettings::stock(
                    "openai",
                    "OpenAI",
                    "https://api.openai.com",
                    "/v1/chat/completions",
                    "gpt-4o",
                    "OPENAI_API_KEY",
                    20,
                ),
                ProviderSettings::stock(
                    "claude",
                    "Anthropic Claude",
                    "https://api.anthropic.com",
                    "/v1/chat/completions",
                    "claude-3-5-sonnet-20241022",
                    "ANTHROPIC_API_KEY",
                    20,
                ),
                ProviderSettings::stock(
                    "gemini",
                    "Google Gemini",
                    "https://generativelanguage.googleapis.com/v1beta/openai/",
                    "/v1beta/openai/chat/completions",
                    "gemini-1.5-pro",
                    "GEMINI_API_KEY",
                    10,
                ),
                ProviderSettings::stock(
                    "together",
                    "Together AI",
                    "https://api.together.xyz",
                    "/v1/chat/completions",
                    "lgai/exaone-3-5-32b-instruct",
                    "TOGETHER_API_KEY",
                    60,
                ),
                ProviderSettings::stock(
                    "deepseek",
                    "DeepSeek",
                    "https://api.deepseek.com",
                    "/v1/chat/completions",
                    "deepseek-chat",
                    "DEEPSEEK_API_KEY",
                    60,
                ),
                ProviderSettings::stock(
                    "grok",
                    "xAI Grok",
                    "https://api.x.ai",
                    "/v1/chat/completions",
                    "grok-2-latest",
                    "XAI_API_KEY",
                    20,
                ),
            ],
        }
    }
}

impl LabConfig {
    /// Defaults overlaid with environment variables.
    ///
    /// Recognised variables: `MAX_CONCURRENT_EXPERIMENTS`, `DEFAULT_TEMPERATURE`, `MAX_TURNS`,
    /// `MAX_ITEMS_PER_EXPERIMENT`, and per provider `<ID>_MODEL`, `<ID>_BASE_URL`,
    /// `<ID>_URL_PATH` and `<ID>_RPM_LIMIT` (id upper-cased).
    pub fn from_env() -> Result<Self, LabError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup, used by tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LabError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = LabConfig::default();

        if let Some(v) = lookup("MAX_CONCURRENT_EXPERIMENTS") {
            config.max_concurrent_experiments = parse_var("MAX_CONCURRENT_EXPERIMENTS", &v)?;
        }
        if let Some(v) = lookup("DEFAULT_TEMPERATURE") {
            config.default_temperature = parse_var("DEFAULT_TEMPERATURE", &v)?;
        }
        if let Some(v) = lookup("MAX_TURNS") {
            config.default_turn_limit = parse_var("MAX_TURNS", &v)?;
        }
        if let Some(v) = lookup("MAX_ITEMS_PER_EXPERIMENT") {
            config.max_items_per_experiment = parse_var("MAX_ITEMS_PER_EXPERIMENT", &v)?;
        }

        for provider in config.providers.iter_mut() {
            let prefix = provider.id.to_uppercase();
            if let Some(model) = lookup(&format!("{}_MODEL", prefix)) {
                if !model.trim().is_empty() {
                    provider.default_model = model.trim().to_string();
                }
            }
            if let Some(url) = lookup(&format!("{}_BASE_URL", prefix)) {
                if !url.trim().is_empty() {
                    provider.base_url = url.trim().to_string();
                }
            }
            if let Some(path) = lookup(&format!("{}_URL_PATH", prefix)) {
                if !path.trim().is_empty() {
                    provider.url_path = path.trim().to_string();
                }
            }
            let rpm_key = format!("{}_RPM_LIMIT", prefix);
            if let Some(v) = lookup(&rpm_key) {
                provider.rpm_limit = parse_var(&rpm_key, &v)?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LabError> {
        if self.max_concurrent_experiments == 0 {
            return Err(LabError::Config(
                "max_concurrent_experiments must be at least 1".into(),
            ));
        }
        if self.max_items_per_experiment == 0 {
            return Err(LabError::Config(
                "max_items_per_experiment must be at least 1".into(),
            ));
        }
        if let Some(p) = self.providers.iter().find(|p| p.rpm_limit == 0) {
            return Err(LabError::Config(format!(
                "provider '{}' has an rpm_limit of 0",
                p.id
            )));
        }
        for provider in &self.providers {
            provider.endpoint()?;
        }
        Ok(())
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderSettings> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// A new spec carrying this configuration's default temperature, turn limit and priority.
    pub fn spec(
        &self,
        name: &str,
        domain: &str,
        experiment_type: ExperimentType,
        dataset: &str,
    ) -> ExperimentSpec {
        ExperimentSpec::new(name, domain, experiment_type, dataset)
            .with_temperature(self.default_temperature)
            .with_turn_limit(self.default_turn_limit)
            .with_priority(self.default_priority)
    }

    pub fn with_max_concurrent_experiments(mut self, max: usize) -> Self {
        self.max_concurrent_experiments = max;
        self
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, LabError> {
    value
        .trim()
        .parse()
        .map_err(|_| LabError::Config(format!("{}='{}' is not a valid value", key, value)))
}
