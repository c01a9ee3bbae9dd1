use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::PlannerError;

/// Narrow vendor boundary: a single completion call. No vendor SDK type
/// leaks past this trait (spec.md §6.5).
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, PlannerError>;
}

/// Builds the configured live client from environment variables, or
/// `None` if no vendor is configured (the caller falls back to the stub
/// planner in that case).
///
/// Honors `LLM_PROVIDER` (`anthropic` | `openai` | `mistral` | `ollama`)
/// when set; otherwise infers the provider from whichever API key is
/// present, preferring Anthropic.
pub fn client_from_env() -> Option<Box<dyn CompletionClient>> {
    let provider = std::env::var("LLM_PROVIDER").ok().map(|p| p.to_lowercase());
    let provider = provider.as_deref();

    if matches!(provider, Some("anthropic")) || (provider.is_none() && has_env("ANTHROPIC_API_KEY")) {
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            return Some(Box::new(AnthropicClient {
                api_key: key,
                model: std::env::var("ANTHROPIC_MODEL")
                    .unwrap_or_else(|_| "claude-3-5-sonnet-20241022".to_string()),
                client: Client::new(),
            }));
        }
    }

    if matches!(provider, Some("openai")) || (provider.is_none() && has_env("OPENAI_API_KEY")) {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            return Some(Box::new(OpenAiCompatibleClient {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: Some(key),
                model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                client: Client::new(),
            }));
        }
    }

    if matches!(provider, Some("mistral")) || (provider.is_none() && has_env("MISTRAL_API_KEY")) {
        if let Ok(key) = std::env::var("MISTRAL_API_KEY") {
            return Some(Box::new(OpenAiCompatibleClient {
                base_url: "https://api.mistral.ai/v1".to_string(),
                api_key: Some(key),
                model: std::env::var("MISTRAL_MODEL")
                    .unwrap_or_else(|_| "mistral-small-latest".to_string()),
                client: Client::new(),
            }));
        }
    }

    if matches!(provider, Some("ollama")) || (provider.is_none() && has_env("OLLAMA_BASE_URL")) {
        let base_url = std::env::var("OLLAMA_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:11434/v1".to_string());
        return Some(Box::new(OpenAiCompatibleClient {
            base_url,
            api_key: None,
            model: std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.1".to_string()),
            client: Client::new(),
        }));
    }

    None
}

fn has_env(name: &str) -> bool {
    std::env::var(name).map(|v| !v.trim().is_empty()).unwrap_or(false)
}

struct AnthropicClient {
    api_key: String,
    model: String,
    client: Client,
}

#[async_trait]
impl CompletionClient for AnthropicClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, PlannerError> {
        let value: serde_json::Value = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("anthropic-version", "2023-06-01")
            .header("x-api-key", &self.api_key)
            .json(&json!({
                "model": self.model,
                "max_tokens": 2048,
                "system": system_prompt,
                "messages": [{"role": "user", "content": user_prompt}],
            }))
            .send()
            .await
            .map_err(|e| PlannerError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| PlannerError::Transport(e.to_string()))?;

        if let Some(err) = value.get("error") {
            return Err(PlannerError::Vendor(
                err.get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown vendor error")
                    .to_string(),
            ));
        }

        value["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PlannerError::Vendor("response carried no completion text".to_string()))
    }
}

/// Covers every vendor whose HTTP surface is OpenAI's `/chat/completions`
/// shape: OpenAI itself, Mistral, and a local Ollama instance.
struct OpenAiCompatibleClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: Client,
}

#[async_trait]
impl CompletionClient for OpenAiCompatibleClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, PlannerError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(&json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "stream": false,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let value: serde_json::Value = req
            .send()
            .await
            .map_err(|e| PlannerError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| PlannerError::Transport(e.to_string()))?;

        if let Some(err) = value.get("error") {
            let message = err
                .as_str()
                .or_else(|| err.get("message").and_then(|m| m.as_str()))
                .unwrap_or("unknown vendor error");
            return Err(PlannerError::Vendor(message.to_string()));
        }

        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PlannerError::Vendor("response carried no completion text".to_string()))
    }
}
