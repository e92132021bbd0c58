use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_LOCAL_ENDPOINT: &str = "http://127.0.0.1:11434/v1/chat/completions";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const SYSTEM_PROMPT: &str = "You are a helpful assistant running inside a wasmgate sandbox.";

/// Process-wide response cache keyed by `model + sha256(prompt)`.
/// Entries are immutable once written; equal prompts are idempotent.
static RESPONSE_CACHE: Lazy<Mutex<HashMap<String, String>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Error)]
pub enum AiError {
    #[error("egress denied to {0}")]
    EgressDenied(String),

    #[error("invalid ai endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("ai connect error: {0}")]
    Connect(String),

    #[error("ai api error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("ai returned no choices")]
    Empty,
}

#[derive(Debug, Clone, Default)]
pub struct AiConfig {
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub token: String,
    pub allowed_hosts: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: std::borrow::Cow<'a, str>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

/// Thin adapter over an OpenAI-compatible chat endpoint, called from the
/// sandbox thread via `host_ask_ai`.
///
/// The blocking HTTP client is built on first use, on the sandbox thread;
/// construction itself never touches the network or the async runtime.
pub struct AiClient {
    cfg: AiConfig,
    http: once_cell::sync::OnceCell<reqwest::blocking::Client>,
}

impl AiClient {
    pub fn new(cfg: AiConfig) -> Self {
        Self {
            cfg,
            http: once_cell::sync::OnceCell::new(),
        }
    }

    fn http(&self) -> Result<&reqwest::blocking::Client, AiError> {
        self.http.get_or_try_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|err| AiError::Connect(err.to_string()))
        })
    }

    fn model(&self) -> &str {
        if self.cfg.model.is_empty() {
            DEFAULT_MODEL
        } else {
            &self.cfg.model
        }
    }

    fn endpoint(&self) -> &str {
        if !self.cfg.endpoint.is_empty() {
            &self.cfg.endpoint
        } else if self.cfg.provider == "local" {
            DEFAULT_LOCAL_ENDPOINT
        } else {
            DEFAULT_ENDPOINT
        }
    }

    pub fn ask(&self, prompt: &str) -> Result<String, AiError> {
        let key = cache_key(self.model(), prompt);
        if let Some(hit) = RESPONSE_CACHE.lock().get(&key) {
            return Ok(hit.clone());
        }

        let endpoint = self.endpoint();
        check_egress(endpoint, &self.cfg.provider, &self.cfg.allowed_hosts)?;

        let request = ChatRequest {
            model: self.model(),
            stream: false,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.into(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt.into(),
                },
            ],
        };

        let mut builder = self.http()?.post(endpoint).json(&request);
        if !self.cfg.token.is_empty() {
            builder = builder.bearer_auth(&self.cfg.token);
        }
        let response = builder
            .send()
            .map_err(|err| AiError::Connect(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(AiError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|err| AiError::Connect(err.to_string()))?;
        let choice = parsed.choices.into_iter().next().ok_or(AiError::Empty)?;
        let content = choice.message.content;

        RESPONSE_CACHE.lock().insert(key, content.clone());
        Ok(content)
    }
}

fn cache_key(model: &str, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    format!("{model}:{}", hex::encode(hasher.finalize()))
}

fn is_loopback_host(host: &str) -> bool {
    host == "localhost" || host == "127.0.0.1" || host == "::1"
}

/// Allow-list gate for outbound AI calls. An empty list permits everything;
/// loopback is always allowed for the `local` provider.
fn check_egress(endpoint: &str, provider: &str, allowed: &[String]) -> Result<(), AiError> {
    if allowed.is_empty() {
        return Ok(());
    }
    let parsed = url::Url::parse(endpoint)
        .map_err(|_| AiError::InvalidEndpoint(endpoint.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| AiError::InvalidEndpoint(endpoint.to_string()))?;

    if provider == "local" && is_loopback_host(host) {
        return Ok(());
    }
    if allowed.iter().any(|entry| host.contains(entry.as_str())) {
        return Ok(());
    }
    Err(AiError::EgressDenied(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_separates_models() {
        assert_ne!(cache_key("a", "prompt"), cache_key("b", "prompt"));
        assert_eq!(cache_key("a", "prompt"), cache_key("a", "prompt"));
    }

    #[test]
    fn empty_allow_list_permits_all() {
        check_egress("https://api.openai.com/v1/chat/completions", "openai", &[]).unwrap();
    }

    #[test]
    fn allow_list_matches_by_substring() {
        let allowed = vec!["openai.com".to_string()];
        check_egress("https://api.openai.com/v1/chat/completions", "openai", &allowed).unwrap();
        let err = check_egress("https://evil.example/v1", "openai", &allowed).unwrap_err();
        assert!(matches!(err, AiError::EgressDenied(host) if host == "evil.example"));
    }

    #[test]
    fn local_provider_always_reaches_loopback() {
        let allowed = vec!["openai.com".to_string()];
        check_egress("http://127.0.0.1:11434/v1/chat/completions", "local", &allowed).unwrap();
        check_egress("http://localhost:11434/v1/chat/completions", "local", &allowed).unwrap();
        assert!(check_egress("http://127.0.0.1:11434/v1", "openai", &allowed).is_err());
    }

    #[test]
    fn cached_answers_skip_the_network() {
        let cfg = AiConfig {
            provider: "openai".to_string(),
            model: "test-model".to_string(),
            // Unroutable: a cache hit must not touch it.
            endpoint: "http://192.0.2.1:1/v1/chat/completions".to_string(),
            ..AiConfig::default()
        };
        let client = AiClient::new(cfg);
        RESPONSE_CACHE
            .lock()
            .insert(cache_key("test-model", "what is up"), "cached answer".to_string());
        assert_eq!(client.ask("what is up").unwrap(), "cached answer");
    }
}
