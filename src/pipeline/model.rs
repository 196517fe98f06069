//! Vision-model interaction: build the chat request, call the backend,
//! post-process the reply.
//!
//! The backend seam is [`VisionBackend`], one method: submit a request, get
//! text or an error. [`OllamaBackend`] is the real network implementation
//! over Ollama's `/api/chat`; tests inject deterministic fakes. Everything
//! the caller relies on — retry, stop-sequence enforcement, validation,
//! truncation flagging — lives in [`transcribe`] so it applies to every
//! backend equally.
//!
//! ## Retry strategy
//!
//! Transport-level failures (timeout, connection refused, 5xx/429) go
//! through the same [`RetryPolicy`] as image fetches. Permanent failures
//! (unknown model, malformed reply) surface immediately.

use crate::config::{SamplingOptions, TranscribeConfig};
use crate::error::ItemError;
use crate::pipeline::encode::EncodedImage;
use crate::retry::{retryable_status, RetryPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// One inference request: the encoded page plus the full prompt and
/// sampling configuration. Constructed per image, never reused.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub image: EncodedImage,
    pub system_prompt: String,
    pub user_prompt: String,
    pub sampling: SamplingOptions,
}

impl TranscriptionRequest {
    /// Build a request for `image` using the config's prompt and sampling.
    pub fn from_config(image: EncodedImage, config: &TranscribeConfig) -> Self {
        Self {
            image,
            system_prompt: config.system_prompt().to_string(),
            user_prompt: crate::prompts::USER_INSTRUCTION.to_string(),
            sampling: config.sampling.clone(),
        }
    }
}

/// What the backend produced for one request.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub text: String,
    /// Generation stopped because the max-token cap was reached. The text
    /// may end mid-word; callers must not treat this as a clean completion.
    pub truncated: bool,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
}

/// Capability seam for the vision model.
///
/// The real implementation is [`OllamaBackend`]; tests substitute a fake
/// that returns canned text or canned failures.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    /// Issue one inference call. No retry at this level.
    async fn submit(&self, request: &TranscriptionRequest) -> Result<ModelReply, ItemError>;
}

// ── Ollama wire types ────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions<'a>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<&'a str>>,
}

#[derive(Serialize)]
struct ChatOptions<'a> {
    temperature: f32,
    top_p: f32,
    repeat_penalty: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    num_predict: u32,
    stop: &'a [String],
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ResponseMessage>,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

// ── Ollama backend ───────────────────────────────────────────────────────

/// Network-backed [`VisionBackend`] speaking the Ollama chat API.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    /// Build a backend from the run configuration.
    ///
    /// Uses its own HTTP client: model calls need a much longer timeout
    /// than image fetches.
    pub fn from_config(config: &TranscribeConfig) -> Result<Self, crate::TranscribeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_secs(config.api_timeout_secs))
            .build()
            .map_err(|e| crate::TranscribeError::Internal(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

#[async_trait]
impl VisionBackend for OllamaBackend {
    async fn submit(&self, request: &TranscriptionRequest) -> Result<ModelReply, ItemError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                    images: None,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_prompt,
                    images: Some(vec![&request.image.data]),
                },
            ],
            stream: false,
            options: ChatOptions {
                temperature: request.sampling.temperature,
                top_p: request.sampling.top_p,
                repeat_penalty: request.sampling.repeat_penalty,
                seed: request.sampling.seed,
                num_predict: request.sampling.max_tokens,
                stop: &request.sampling.stop,
            },
        };

        let url = self.chat_url();
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ItemError::ModelUnavailable {
                        base_url: self.base_url.clone(),
                        detail: format!("{e}"),
                    }
                } else {
                    // Timeouts and mid-flight drops are transient.
                    ItemError::Network {
                        url: url.clone(),
                        attempts: 1,
                        detail: format!("{e}"),
                    }
                }
            })?;

        let status = resp.status().as_u16();
        if status != 200 {
            let text = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.error)
                .unwrap_or(text);

            if status == 404 && detail.contains("not found") {
                return Err(ItemError::ModelMissing {
                    model: self.model.clone(),
                });
            }
            if retryable_status(status) {
                return Err(ItemError::Network {
                    url,
                    attempts: 1,
                    detail: format!("HTTP {status}: {detail}"),
                });
            }
            return Err(ItemError::Model {
                attempts: 1,
                detail: format!("HTTP {status}: {detail}"),
            });
        }

        let parsed: ChatResponse = resp.json().await.map_err(|e| ItemError::Model {
            attempts: 1,
            detail: format!("malformed response: {e}"),
        })?;

        let content = parsed
            .message
            .map(|m| m.content)
            .ok_or_else(|| ItemError::Model {
                attempts: 1,
                detail: "malformed response: missing message content".into(),
            })?;

        let truncated = parsed.done_reason.as_deref() == Some("length");
        debug!(
            prompt_tokens = parsed.prompt_eval_count.unwrap_or(0),
            output_tokens = parsed.eval_count.unwrap_or(0),
            truncated,
            "model reply received"
        );

        Ok(ModelReply {
            text: content,
            truncated,
            prompt_tokens: parsed.prompt_eval_count.unwrap_or(0),
            output_tokens: parsed.eval_count.unwrap_or(0),
        })
    }
}

// ── Client-side post-processing ──────────────────────────────────────────

/// Cut `text` at the earliest occurrence of any stop marker.
///
/// The backend is asked to stop at these markers itself, but the contract
/// does not guarantee the marker (or text after it) is excluded from the
/// reply, so the cut is enforced here as well.
pub fn enforce_stop_sequences(text: &str, stops: &[String]) -> String {
    let cut = stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min();

    match cut {
        Some(idx) => text[..idx].trim_end().to_string(),
        None => text.trim_end().to_string(),
    }
}

fn is_retryable(err: &ItemError) -> bool {
    matches!(
        err,
        ItemError::Network { .. } | ItemError::ModelUnavailable { .. }
    )
}

/// Submit with retry, then enforce stops and validate.
///
/// Returns the cleaned reply plus the number of retries consumed. An empty
/// or whitespace-only transcription after stop enforcement is a
/// [`ItemError::Validation`] failure, not a success with empty text.
pub async fn transcribe(
    backend: &dyn VisionBackend,
    request: &TranscriptionRequest,
    policy: &RetryPolicy,
) -> Result<(ModelReply, u32), ItemError> {
    let mut attempt = 0u32;

    let mut reply = loop {
        attempt += 1;
        match backend.submit(request).await {
            Ok(reply) => break reply,
            Err(err) if is_retryable(&err) && policy.should_retry(attempt) => {
                let backoff = policy.delay(attempt);
                warn!(
                    attempt,
                    max = policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "transient model failure, retrying"
                );
                sleep(backoff).await;
            }
            Err(err) => return Err(stamp_attempts(err, attempt)),
        }
    };

    reply.text = enforce_stop_sequences(&reply.text, &request.sampling.stop);

    if reply.text.trim().is_empty() {
        return Err(ItemError::Validation {
            detail: "empty transcription".into(),
        });
    }
    if reply.truncated {
        warn!("transcription hit the max-token cap; marking as truncated");
    }

    Ok((reply, attempt - 1))
}

/// Rewrite the attempt count on the final error so it reflects the whole
/// retry loop, not the single call that produced it.
fn stamp_attempts(err: ItemError, attempts: u32) -> ItemError {
    match err {
        ItemError::Network { url, detail, .. } => ItemError::Network {
            url,
            attempts,
            detail,
        },
        ItemError::Model { detail, .. } => ItemError::Model { attempts, detail },
        other => other,
    }
}
