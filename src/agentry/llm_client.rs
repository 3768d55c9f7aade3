//! Provider-agnostic chat-completion client.
//!
//! Applications interact with the inference provider through the [`LlmClient`]
//! trait and the lightweight data types defined here.  The trait abstracts
//! over concrete endpoints while the supporting structs describe chat
//! transcripts and token accounting.
//!
//! The bundled [`HttpLlmClient`] speaks the OpenAI-compatible
//! `/v1/chat/completions` wire contract, which is what both local gateways
//! (Ollama and friends) and hosted providers expose.  Which endpoint is used
//! is configuration; callers never see the difference.
//!
//! # Failure classification
//!
//! Failures split into two kinds:
//!
//! - **Transient**: timeouts, connection resets, HTTP 5xx, and HTTP 429.
//!   Retried internally with exponential backoff up to a small bound, then
//!   surfaced as [`LlmError::Transient`].
//! - **Permanent**: any other 4xx, or an unparseable response body.
//!   Surfaced immediately.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentry::llm_client::{ChatMessage, CompletionOptions, HttpLlmClient, LlmClient};
//!
//! # async {
//! let client = HttpLlmClient::new("http://localhost:11434", "deepseek-r1:14b");
//! let reply = client
//!     .complete(
//!         &[ChatMessage::user("Summarise Rust ownership in one sentence.")],
//!         &CompletionOptions::default(),
//!     )
//!     .await?;
//! println!("{} ({} tokens)", reply.content, reply.usage.total_tokens);
//! # Ok::<(), agentry::llm_client::LlmError>(())
//! # };
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Completion requests wait this long before the HTTP layer gives up.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(180);

/// Base delay for exponential backoff between transient-failure retries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Conversation role attached to a [`ChatMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Primes or constrains assistant behaviour.
    System,
    /// A human (or orchestrator-synthesised) request.
    User,
    /// A model response.
    Assistant,
}

impl ChatRole {
    /// The lowercase wire name (`"system"`, `"user"`, `"assistant"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// One entry in an ordered chat transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role associated with the message.
    pub role: ChatRole,
    /// The message body.
    pub content: String,
}

impl ChatMessage {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// Build an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Tunables forwarded with every completion request.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    /// Sampling temperature.
    pub temperature: f32,
    /// Upper bound on generated tokens.
    pub max_tokens: usize,
    /// Optional tool definitions, already in the provider's JSON shape.
    /// When present, `tool_choice: "auto"` is sent alongside.
    pub tools: Option<Vec<serde_json::Value>>,
    /// Opaque session identifier some gateways use for affinity.  Ignored by
    /// plain chat-completion endpoints.
    pub session_hint: Option<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
            tools: None,
            session_hint: None,
        }
    }
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt/input tokens billed by the provider.
    #[serde(default)]
    pub prompt_tokens: usize,
    /// Generated/output tokens billed by the provider.
    #[serde(default)]
    pub completion_tokens: usize,
    /// Convenience total equal to `prompt_tokens + completion_tokens`.
    #[serde(default)]
    pub total_tokens: usize,
}

/// The uniform result of a completion call.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Final assistant text.
    pub content: String,
    /// Provider-specific completion status (e.g. `"stop"`), if reported.
    pub finish_reason: Option<String>,
    /// Model identifier the provider actually served.
    pub model: String,
    /// Token accounting; zeroed when the provider reports none.
    pub usage: TokenUsage,
    /// Native tool calls requested by the assistant, as raw JSON.  Empty for
    /// plain text responses.
    pub tool_calls: Vec<serde_json::Value>,
}

/// Errors surfaced by [`LlmClient::complete`].
#[derive(Debug, Clone)]
pub enum LlmError {
    /// A retriable failure (timeout, connection reset, 5xx, 429) that
    /// persisted through the bounded retry loop.
    Transient {
        /// Description of the last failure seen.
        message: String,
        /// How many attempts were made before giving up.
        attempts: u32,
    },
    /// A non-retriable failure (4xx other than 429).
    Permanent {
        /// HTTP status, when the failure came from a response.
        status: Option<u16>,
        /// Description of the failure.
        message: String,
    },
    /// The provider answered 200 but the body did not match the contract.
    InvalidResponse(String),
}

impl LlmError {
    /// `true` for failures that a caller could reasonably retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Transient { .. })
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Transient { message, attempts } => {
                write!(f, "LLM transient failure after {} attempts: {}", attempts, message)
            }
            LlmError::Permanent { status: Some(s), message } => {
                write!(f, "LLM error ({}): {}", s, message)
            }
            LlmError::Permanent { status: None, message } => {
                write!(f, "LLM error: {}", message)
            }
            LlmError::InvalidResponse(message) => {
                write!(f, "LLM invalid response: {}", message)
            }
        }
    }
}

impl Error for LlmError {}

/// Trait-driven abstraction over a chat-completion provider.
///
/// Implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between agents via `Arc<dyn LlmClient>`.  The abstraction
/// deliberately excludes conversation bookkeeping; transcripts are composed
/// by the caller on every request.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a full request/response chat completion.
    ///
    /// `messages` must include any system priming the caller wants to send.
    /// Implementations retry transient failures internally; an `Err` return
    /// is final for this call.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        opts: &CompletionOptions,
    ) -> Result<Completion, LlmError>;

    /// Identifier used to select the upstream model (e.g. `"deepseek-r1:14b"`).
    fn model_name(&self) -> &str;
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [serde_json::Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: TokenUsage,
    #[serde(default)]
    model: String,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<serde_json::Value>,
}

/// [`LlmClient`] over an OpenAI-compatible HTTP endpoint.
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    max_retries: u32,
}

impl HttpLlmClient {
    /// Create a client for `{base_url}/v1/chat/completions` using `model`.
    ///
    /// The underlying HTTP client carries a 180 s request timeout, matching
    /// the completion-latency budget of local inference gateways.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(COMPLETION_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            max_retries: 3,
        }
    }

    /// Override the transient-failure retry bound (builder pattern).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn send_once(
        &self,
        messages: &[ChatMessage],
        opts: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        let request = WireRequest {
            model: &self.model,
            messages,
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
            tools: opts.tools.as_deref(),
            tool_choice: opts.tools.as_ref().map(|_| "auto"),
        };

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    LlmError::Transient {
                        message: e.to_string(),
                        attempts: 1,
                    }
                } else {
                    LlmError::Permanent {
                        status: None,
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("{}: {}", status, truncate(&body, 200));
            // 429 is rate limiting, treated like a 5xx.
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(LlmError::Transient {
                    message,
                    attempts: 1,
                });
            }
            return Err(LlmError::Permanent {
                status: Some(status.as_u16()),
                message,
            });
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("response carried no choices".into()))?;

        let model = if wire.model.is_empty() {
            self.model.clone()
        } else {
            wire.model
        };

        Ok(Completion {
            content: choice.message.content,
            finish_reason: choice.finish_reason,
            model,
            usage: wire.usage,
            tool_calls: choice.message.tool_calls,
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        opts: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(messages, opts).await {
                Ok(completion) => return Ok(completion),
                Err(err) if err.is_transient() && attempt <= self.max_retries => {
                    let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                    log::warn!(
                        "LLM call failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt,
                        self.max_retries + 1,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(LlmError::Transient { message, .. }) => {
                    return Err(LlmError::Transient { message, attempts: attempt });
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Clamp a string to at most `max` characters for log/error embedding.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let clipped: String = text.chars().take(max).collect();
        format!("{}...", clipped)
    }
}
