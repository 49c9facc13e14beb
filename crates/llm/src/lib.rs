use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::json;

use babel_config::LlmConfig;

mod completion;

pub use completion::{CompletionService, MetadataCompleter, build_metadata_prompt};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    OpenRouter,
    Ollama,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::OpenRouter => "openrouter",
            Provider::Ollama => "ollama",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => OPENAI_BASE_URL,
            Provider::OpenRouter => OPENROUTER_BASE_URL,
            Provider::Ollama => OLLAMA_BASE_URL,
        }
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "openrouter" => Ok(Provider::OpenRouter),
            "ollama" => Ok(Provider::Ollama),
            other => Err(anyhow!("unknown llm provider '{other}'")),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Clients ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Non-streaming `/api/generate` constrained to JSON output.
    async fn generate_json(&self, model: &str, prompt: &str) -> Result<String> {
        let endpoint = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": model,
            "prompt": prompt,
            "format": "json",
            "stream": false
        });

        let response = self
            .client
            .post(endpoint)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("Ollama unavailable at {}", self.base_url))?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("Ollama error ({status}): {body}");
        }

        body.get("response")
            .and_then(|value| value.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("Ollama response missing text: {body}"))
    }
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint (OpenAI
/// itself and OpenRouter).
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    openrouter: bool,
}

impl OpenAiClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        openrouter: bool,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            openrouter,
        }
    }

    async fn chat_json(&self, model: &str, prompt: &str) -> Result<String> {
        if self.api_key.trim().is_empty() {
            bail!("API key missing; set llm.api_key or OPENAI_API_KEY");
        }

        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": model,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "response_format": {"type": "json_object"}
        });

        let mut request = self.client.post(endpoint).bearer_auth(&self.api_key);
        if self.openrouter {
            request = request
                .header("HTTP-Referer", "https://babel.local")
                .header("X-Title", "Babel");
        }
        let response = request.json(&payload).send().await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("completion error ({status}): {body}");
        }

        chat_message_content(&body)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("completion response missing content: {body}"))
    }
}

fn chat_message_content(body: &serde_json::Value) -> Option<&str> {
    body.get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
}

#[derive(Debug, Clone)]
enum Backend {
    Ollama(OllamaClient),
    OpenAi(OpenAiClient),
}

/// Provider-selected LLM client.  Every call returns the raw model text; a
/// transport or API failure is an `Err`, never a text reply.
#[derive(Debug, Clone)]
pub struct LlmRouter {
    provider: Provider,
    model: String,
    backend: Backend,
}

impl LlmRouter {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let provider: Provider = config.provider.parse()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        let base_url = if config.base_url.trim().is_empty() {
            provider.default_base_url().to_string()
        } else {
            config.base_url.clone()
        };

        let backend = match provider {
            Provider::Ollama => Backend::Ollama(OllamaClient::new(client, base_url)),
            Provider::OpenAi | Provider::OpenRouter => Backend::OpenAi(OpenAiClient::new(
                client,
                base_url,
                config.api_key.clone(),
                provider == Provider::OpenRouter,
            )),
        };

        Ok(Self {
            provider,
            model: config.model.clone(),
            backend,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Ask for a JSON reply to `prompt`.
    pub async fn chat_json(&self, prompt: &str) -> Result<String> {
        match &self.backend {
            Backend::Ollama(client) => client.generate_json(&self.model, prompt).await,
            Backend::OpenAi(client) => client.chat_json(&self.model, prompt).await,
        }
    }
}

// ── Structured output extraction ──────────────────────────────────────────────

/// Extract the first valid JSON value from an LLM response.
///
/// Prefers a fenced ` ```json ` block; otherwise takes the span from the
/// first `{` to the last `}`.  Returns `None` when neither parses as `T`.
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    // Strategy 1: fenced ```json ... ``` blocks.
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(json_start) = after_fence.find(|c: char| !c.is_whitespace()) {
            let json_body = &after_fence[json_start..];
            if let Some(fence_end) = json_body.find("```") {
                let json_str = json_body[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    // Strategy 2: bare JSON object, first '{' to last '}'.
    let trimmed = response.trim();
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                let candidate = &trimmed[start..=end];
                if let Ok(val) = serde_json::from_str(candidate) {
                    return Some(val);
                }
            }
        }
    }

    None
}

// ── Tests ────────────────────────────────────────────────────────────────────
