//! OpenAI-compatible chat-completions client.
//!
//! Handles both conventional models and reasoning models, which take
//! `max_completion_tokens` and reject temperature/top_p. Requests retry
//! with a jittered delay; client errors (400/401/403) do not.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use evo_core::config::{LlmModelConfig, DEFAULT_SYSTEM_MESSAGE, DEFAULT_TIMEOUT_SECS};
use evo_core::{EvolveError, LlmMessage, LlmResponse, Role, TokenUsage};

/// Model-name prefixes that mark a reasoning model.
const REASONING_PREFIXES: &[&str] = &[
    "o1",
    "o1-",
    "o3",
    "o3-",
    "o4-",
    "gpt-5",
    "gpt-5-",
    "gpt-oss-120b",
    "gpt-oss-20b",
];

/// Whether a model name denotes a reasoning model (case-insensitive).
pub fn is_reasoning_model(name: &str) -> bool {
    let lower = name.to_lowercase();
    REASONING_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

/// An oracle backend. Implementations must be safe for concurrent use.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate from a bare prompt using the configured system message.
    async fn generate(&self, prompt: &str) -> Result<LlmResponse, EvolveError>;

    /// Generate from an explicit system message and conversation.
    async fn generate_with_system(
        &self,
        system: &str,
        messages: &[LlmMessage],
    ) -> Result<LlmResponse, EvolveError>;

    fn model_name(&self) -> &str;
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiClient {
    config: LlmModelConfig,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: LlmModelConfig) -> Result<Self, EvolveError> {
        let timeout = if config.timeout == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            config.timeout
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| EvolveError::OracleTransport {
                status: None,
                message: e.to_string(),
            })?;

        Ok(Self { config, http })
    }

    pub fn config(&self) -> &LlmModelConfig {
        &self.config
    }

    fn is_reasoning(&self) -> bool {
        is_reasoning_model(&self.config.name)
    }

    fn request_body(&self, messages: &[LlmMessage]) -> Value {
        let mut body = json!({
            "model": self.config.name,
            "messages": messages,
        });

        if self.is_reasoning() {
            body["max_completion_tokens"] = json!(self.config.max_tokens);
        } else {
            body["max_tokens"] = json!(self.config.max_tokens);
            body["temperature"] = json!(self.config.temperature);
            body["top_p"] = json!(self.config.top_p);
        }

        if let Some(ref effort) = self.config.reasoning_effort {
            body["reasoning_effort"] = json!(effort);
        }
        if self.config.random_seed > 0 {
            body["seed"] = json!(self.config.random_seed);
        }

        body
    }

    async fn request(&self, messages: &[LlmMessage]) -> Result<LlmResponse, EvolveError> {
        let url = format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        );

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&self.request_body(messages))
            .send()
            .await
            .map_err(|e| EvolveError::OracleTransport {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EvolveError::OracleTransport {
                status: Some(status.as_u16()),
                message: e.to_string(),
            })?;

        if !status.is_success() {
            return Err(EvolveError::OracleTransport {
                status: Some(status.as_u16()),
                message: body,
            });
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).map_err(|e| EvolveError::OracleParse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EvolveError::OracleParse("no choices in response".to_string()))?;

        Ok(LlmResponse {
            content: choice.message.content,
            model: parsed.model,
            usage: TokenUsage {
                prompt_tokens: parsed.usage.prompt_tokens,
                completion_tokens: parsed.usage.completion_tokens,
                total_tokens: parsed.usage.total_tokens,
            },
            duration: Duration::ZERO,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(&self, prompt: &str) -> Result<LlmResponse, EvolveError> {
        let system = if self.config.system_message.is_empty() {
            DEFAULT_SYSTEM_MESSAGE
        } else {
            &self.config.system_message
        };
        self.generate_with_system(system, &[LlmMessage::user(prompt)])
            .await
    }

    async fn generate_with_system(
        &self,
        system: &str,
        messages: &[LlmMessage],
    ) -> Result<LlmResponse, EvolveError> {
        let mut all = Vec::with_capacity(messages.len() + 1);
        all.push(LlmMessage {
            role: Role::System,
            content: system.to_string(),
        });
        all.extend_from_slice(messages);

        let start = Instant::now();
        let retry_delay = Duration::from_secs(self.config.retry_delay);
        let mut last_err = None;

        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                let jitter = retry_delay.mul_f64(0.5 + 0.5 * rand::thread_rng().gen::<f64>());
                debug!(attempt, delay = ?jitter, model = %self.config.name, "retrying oracle request");
                tokio::time::sleep(jitter).await;
            }

            match self.request(&all).await {
                Ok(mut response) => {
                    response.duration = start.elapsed();
                    return Ok(response);
                }
                Err(e) if !e.is_retriable() => return Err(e),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| EvolveError::OracleTransport {
            status: None,
            message: "max retries exceeded".to_string(),
        }))
    }

    fn model_name(&self) -> &str {
        &self.config.name
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: String,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}
