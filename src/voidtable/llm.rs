//! Provider-agnostic LLM adapter.
//!
//! Every agent treats its language model as an opaque request/response
//! oracle behind the [`LlmClient`] trait. The Director and players never see
//! HTTP: tests inject [`ScriptedLlmClient`]s, replays inject the cache-backed
//! client from [`replay`](crate::voidtable::replay), and live play uses
//! [`LiveLlmClient`] speaking an Anthropic-style messages endpoint.
//!
//! Failures are expected and non-fatal — callers fall back to template
//! narration or template actions rather than aborting the session.

use async_trait::async_trait;
use log::debug;
use serde_json::json;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// One completion request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Optional system primer.
    pub system: Option<String>,
    /// The user-turn prompt.
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            temperature: 0.7,
            max_tokens: 500,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Token accounting mirrored from the provider, when available.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// One completion response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// Adapter errors. Transport and parse failures are recoverable — callers
/// fall back to templates.
#[derive(Debug)]
pub enum LlmError {
    Transport(String),
    Parse(String),
    EmptyResponse,
    /// Replay cache had no entry for this call.
    CacheMiss(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Transport(msg) => write!(f, "llm transport error: {}", msg),
            LlmError::Parse(msg) => write!(f, "llm parse error: {}", msg),
            LlmError::EmptyResponse => write!(f, "llm returned an empty response"),
            LlmError::CacheMiss(key) => write!(f, "replay cache miss for {}", key),
        }
    }
}

impl Error for LlmError {}

/// The oracle every agent talks to.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Identifier of the underlying model (for logs and prompt metadata).
    fn model_name(&self) -> &str;
}

/// Live client speaking the Anthropic-style `/v1/messages` surface.
pub struct LiveLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LiveLlmClient {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com/v1";

    pub fn new(api_key: &str, model: &str) -> Self {
        Self::with_base_url(api_key, model, Self::DEFAULT_BASE_URL)
    }

    /// Point at a custom compatible endpoint (proxies, local gateways).
    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    /// Construct from the conventional environment variable.
    pub fn from_env(model: &str) -> Option<Self> {
        let key = std::env::var("ANTHROPIC_API_KEY").ok()?;
        Some(Self::new(&key, model))
    }
}

#[async_trait]
impl LlmClient for LiveLlmClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{"role": "user", "content": request.prompt}],
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }

        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Transport(format!(
                "status {}: {}",
                status,
                payload
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown")
            )));
        }

        let content = payload
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|blocks| blocks.first())
            .and_then(|block| block.get("text"))
            .and_then(|t| t.as_str())
            .map(str::trim)
            .unwrap_or("");
        if content.is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        let usage = payload.get("usage").map(|u| TokenUsage {
            input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
            output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
        });

        Ok(LlmResponse {
            content: content.to_string(),
            usage,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Test double returning a fixed script of responses in order. Once the
/// script is exhausted the last line repeats.
pub struct ScriptedLlmClient {
    name: String,
    script: Mutex<Vec<String>>,
    cursor: AtomicUsize,
    /// Every prompt this client was asked, for assertions.
    pub prompts_seen: Mutex<Vec<String>>,
}

impl ScriptedLlmClient {
    pub fn new(name: &str, script: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script),
            cursor: AtomicUsize::new(0),
            prompts_seen: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: always return the same text.
    pub fn always(name: &str, response: &str) -> Self {
        Self::new(name, vec![response.to_string()])
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        self.prompts_seen
            .lock()
            .expect("scripted prompts poisoned")
            .push(request.prompt.clone());
        let script = self.script.lock().expect("scripted responses poisoned");
        if script.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst).min(script.len() - 1);
        debug!("scripted llm {} serving line {}", self.name, index);
        Ok(LlmResponse {
            content: script[index].clone(),
            usage: None,
        })
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_client_serves_in_order_then_repeats() {
        let client = ScriptedLlmClient::new(
            "stub",
            vec!["first".to_string(), "second".to_string()],
        );
        assert_eq!(client.complete(LlmRequest::new("a")).await.unwrap().content, "first");
        assert_eq!(client.complete(LlmRequest::new("b")).await.unwrap().content, "second");
        assert_eq!(client.complete(LlmRequest::new("c")).await.unwrap().content, "second");
        assert_eq!(client.prompts_seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_script_is_an_error() {
        let client = ScriptedLlmClient::new("stub", vec![]);
        assert!(matches!(
            client.complete(LlmRequest::new("x")).await,
            Err(LlmError::EmptyResponse)
        ));
    }

    #[test]
    fn test_request_builder() {
        let req = LlmRequest::new("hello")
            .with_system("be brief")
            .with_temperature(0.3)
            .with_max_tokens(128);
        assert_eq!(req.system.as_deref(), Some("be brief"));
        assert_eq!(req.max_tokens, 128);
    }
}
