use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use webanswer_core::{ChatMessage, Completion, CompletionBackend, CompletionRequest, Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.together.xyz";
pub const DEFAULT_MODEL: &str = "meta-llama/Meta-Llama-3.1-8B-Instruct-Turbo";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_MAX_RETRIES: usize = 3;

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn llm_base_url_from_env() -> Option<String> {
    env("WEBANSWER_LLM_BASE_URL")
}

fn llm_api_key_from_env() -> Option<String> {
    env("WEBANSWER_LLM_API_KEY").or_else(|| env("TOGETHER_API_KEY"))
}

fn llm_model_from_env() -> Option<String> {
    env("WEBANSWER_LLM_MODEL")
}

pub fn llm_api_key_configured() -> bool {
    llm_api_key_from_env().is_some()
}

/// Chat-completions client for any OpenAI-compatible endpoint (Together by default).
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    max_retries: usize,
    initial_backoff: Duration,
}

impl OpenAiCompatClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: INITIAL_BACKOFF,
        }
    }

    /// The API key is required for the default endpoint; a custom base URL may run without one.
    pub fn from_env(client: reqwest::Client, model_override: Option<String>) -> Result<Self> {
        let base_url = llm_base_url_from_env();
        let api_key = llm_api_key_from_env();
        if base_url.is_none() && api_key.is_none() {
            return Err(Error::NotConfigured(
                "missing WEBANSWER_LLM_API_KEY (or TOGETHER_API_KEY)".to_string(),
            ));
        }
        let model = model_override
            .or_else(llm_model_from_env)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let mut c = Self::new(
            client,
            base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model,
        );
        c.api_key = api_key;
        if let Some(ms) = env("WEBANSWER_LLM_TIMEOUT_MS").and_then(|s| s.parse::<u64>().ok()) {
            c.timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env("WEBANSWER_LLM_MAX_RETRIES").and_then(|s| s.parse::<usize>().ok()) {
            c.max_retries = n;
        }
        Ok(c)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint_chat_completions(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn send_once(&self, body: &ChatCompletionsRequest) -> std::result::Result<Completion, AttemptError> {
        let mut rb = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(k) = &self.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }

        let resp = rb.json(body).send().await.map_err(|e| AttemptError {
            retryable: true,
            message: e.to_string(),
        })?;
        let status = resp.status();
        if !status.is_success() {
            let code = status.as_u16();
            return Err(AttemptError {
                retryable: code == 408 || code == 429 || status.is_server_error(),
                message: format!("chat.completions HTTP {status}"),
            });
        }

        let parsed: ChatCompletionsResponse = resp.json().await.map_err(|e| AttemptError {
            // A body cut off by the timeout is transient; a well-formed but wrong body is not.
            retryable: e.is_timeout(),
            message: e.to_string(),
        })?;
        let usage = parsed.usage.unwrap_or_default();
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AttemptError {
                retryable: false,
                message: "chat.completions returned no message content".to_string(),
            })?;
        Ok(Completion {
            text,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }
}

#[derive(Debug)]
struct AttemptError {
    retryable: bool,
    message: String,
}

#[async_trait::async_trait]
impl CompletionBackend for OpenAiCompatClient {
    async fn complete(&self, req: &CompletionRequest) -> Result<Completion> {
        let body = ChatCompletionsRequest {
            model: if req.model.is_empty() {
                self.model.clone()
            } else {
                req.model.clone()
            },
            messages: req.messages.clone(),
            max_tokens: Some(req.max_tokens),
            temperature: Some(req.temperature),
            stream: Some(false),
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(MAX_BACKOFF)
            .with_factor(2.0)
            .with_max_times(self.max_retries);

        let completion = (|| self.send_once(&body))
            .retry(&backoff)
            .when(|e: &AttemptError| e.retryable)
            .notify(|e: &AttemptError, delay: Duration| {
                warn!(error = %e.message, delay_ms = delay.as_millis() as u64, "retrying completion");
            })
            .await
            .map_err(|e| Error::Synthesis(e.message))?;

        debug!(
            model = %body.model,
            prompt_tokens = completion.prompt_tokens,
            completion_tokens = completion.completion_tokens,
            "completion finished"
        );
        Ok(completion)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}
