use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::json;
use tracing::warn;

/// Connection and budget settings for the remote classifier.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub context_window: usize,
    pub max_output_tokens: usize,
    /// Conservative chars-per-token estimate for multilingual/structured
    /// content.
    pub chars_per_token: usize,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            api_key: String::new(),
            model: "claude-3-5-haiku-latest".to_string(),
            context_window: 100_000,
            max_output_tokens: 4_096,
            chars_per_token: 2,
            timeout_secs: 60,
        }
    }
}

impl LlmConfig {
    /// Character budget for a single rendered prompt.
    pub fn max_total_chars(&self) -> usize {
        self.context_window
            .saturating_sub(self.max_output_tokens)
            .saturating_mul(self.chars_per_token)
            .max(1)
    }
}

/// The one seam to the LLM transport. This subsystem owns prompt
/// construction and response parsing only; model selection, authentication,
/// and network retries live behind this trait.
pub trait LlmInvoker {
    fn invoke(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// Blocking HTTP invoker for an Anthropic-style messages endpoint.
pub struct UreqInvoker {
    agent: ureq::Agent,
    config: LlmConfig,
}

impl UreqInvoker {
    pub fn new(config: LlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            bail!("llm api key is empty; set TOCTAG_API_KEY or --api-key");
        }
        let timeout = Duration::from_secs(config.timeout_secs);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Ok(Self { agent, config })
    }
}

impl LlmInvoker for UreqInvoker {
    fn invoke(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let payload = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_output_tokens,
            "system": system_prompt,
            "messages": [{"role": "user", "content": user_prompt}],
        });

        let response = self
            .agent
            .post(&self.config.endpoint)
            .set("content-type", "application/json")
            .set("x-api-key", &self.config.api_key)
            .set("anthropic-version", "2023-06-01")
            .send_json(payload);

        let body = match response {
            Ok(resp) => resp
                .into_string()
                .context("failed to read llm response body")?,
            Err(ureq::Error::Status(code, resp)) => {
                let text = resp.into_string().unwrap_or_default();
                warn!(status = code, "llm endpoint returned error status");
                return Err(anyhow!("llm endpoint returned {code}: {}", text.trim()));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("llm transport error: {err}"));
            }
        };

        let value: serde_json::Value =
            serde_json::from_str(&body).context("llm response body is not json")?;
        let text = value["content"]
            .as_array()
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find_map(|block| block["text"].as_str().map(str::to_string))
            })
            .ok_or_else(|| anyhow!("llm response has no text content block"))?;

        Ok(text)
    }
}
