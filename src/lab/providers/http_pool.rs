//! Shared `reqwest::Client`s, one per provider base URL.
//!
//! A consensus experiment over a large dataset sends thousands of completions to the same
//! two or three hosts. Every [`OpenAICompatibleProvider`](super::openai_compatible::OpenAICompatibleProvider)
//! built for a base URL gets the same client, so its connections outlive a single call.
//! Idle connections are dropped after 90s and at most 10 are parked per host. Requests time
//! out after 300s because final-turn prompts carrying a whole transcript can take minutes.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

lazy_static! {
    static ref CLIENTS_BY_BASE_URL: Mutex<HashMap<String, reqwest::Client>> =
        Mutex::new(HashMap::new());
}

fn build_client(base_url: &str) -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .timeout(Duration::from_secs(300))
        .build()
        .unwrap_or_else(|e| {
            log::warn!("using an untuned HTTP client for {}: {}", base_url, e);
            reqwest::Client::new()
        })
}

/// The client for `base_url`, created on first use.
pub fn get_http_client(base_url: &str) -> reqwest::Client {
    let mut clients = CLIENTS_BY_BASE_URL
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    clients
        .entry(base_url.to_string())
        .or_insert_with(|| build_client(base_url))
        .clone()
}

/// How many base URLs have a client.
pub fn pool_size() -> usize {
    CLIENTS_BY_BASE_URL
        .lock()
        .map(|clients| clients.len())
        .unwrap_or_else(|poisoned| poisoned.into_inner().len())
}
