//! Concrete [`ModelProvider`](crate::lab::provider::ModelProvider) implementations.
//!
//! * [`openai_compatible`]: any endpoint speaking the OpenAI chat-completions protocol
//!   (OpenAI, Together, DeepSeek, xAI, Gemini's compatibility layer, ...).
//! * [`rate_limited`]: a wrapper adding a per-provider requests-per-minute window and
//!   exponential-backoff retries around any other provider.
//! * [`http_pool`]: the shared `reqwest` connection pool used by the HTTP providers.

pub mod http_pool;
pub mod openai_compatible;
pub mod rate_limited;
