//! Configuration types for the transcription pipeline.
//!
//! All behaviour is controlled through [`TranscribeConfig`], built via its
//! [`TranscribeConfigBuilder`]. Keeping every knob in one struct avoids
//! hidden module-level globals, makes configs shareable across tasks, and
//! lets tests inject alternate sampling parameters without touching
//! process-wide state.

use crate::error::TranscribeError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default vision model. A small quantised model is enough for handwriting
/// when decoding is fully deterministic.
pub const DEFAULT_MODEL: &str = "qwen2.5vl:3b";

/// Default Ollama endpoint.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Metadata field carrying the persistent identifier in repository exports.
pub const DEFAULT_PID_FIELD: &str = "mods_id_bdr_pid_ssim";

/// Sampling parameters sent with every model request.
///
/// Transcription wants the model to read, not to write: temperature 0 and a
/// very small nucleus keep token selection pinned to what is on the page,
/// and a fixed seed makes reruns byte-identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingOptions {
    /// Decoding randomness. 0.0 = fully deterministic. Default: 0.0.
    pub temperature: f32,

    /// Nucleus sampling cutoff. Default: 0.05 (near-greedy).
    pub top_p: f32,

    /// Repetition penalty. 1.0 disables it. Handwritten letters legitimately
    /// repeat salutations and place names; penalising repeats corrupts them.
    pub repeat_penalty: f32,

    /// RNG seed for the backend. Fixed by default so identical input
    /// produces identical output across runs.
    pub seed: Option<i64>,

    /// Generation length cap (`num_predict`). Default: 1048.
    ///
    /// A single manuscript page rarely exceeds ~700 tokens of prose. When
    /// the cap is hit anyway the reply is flagged as truncated rather than
    /// silently accepted; see [`crate::pipeline::model::ModelReply`].
    pub max_tokens: u32,

    /// Strings that terminate generation early.
    ///
    /// Vision models like to append "Correction Notes" or "Analysis" after
    /// a transcription. Cutting generation at these markers keeps the output
    /// to transcribed text only. Also enforced client-side; see
    /// [`crate::pipeline::model`].
    pub stop: Vec<String>,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 0.05,
            repeat_penalty: 1.0,
            seed: Some(18_900_820),
            max_tokens: 1048,
            stop: crate::prompts::default_stop_sequences(),
        }
    }
}

/// Configuration for a transcription run.
///
/// Built via [`TranscribeConfig::builder()`] or using
/// [`TranscribeConfig::default()`].
///
/// # Example
/// ```rust
/// use iiif2txt::TranscribeConfig;
///
/// let config = TranscribeConfig::builder()
///     .model("llama3.2-vision")
///     .concurrency(4)
///     .output_dir("transcripts")
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct TranscribeConfig {
    /// Model identifier on the backend, e.g. "qwen2.5vl:3b".
    pub model: String,

    /// Base URL of the model endpoint. Default: `http://localhost:11434`.
    pub base_url: String,

    /// Sampling parameters for every request.
    pub sampling: SamplingOptions,

    /// Custom system prompt. If None, uses the built-in paleographer prompt.
    pub system_prompt: Option<String>,

    /// Maximum attempts per network call (image fetch, manifest fetch,
    /// model call). Default: 5. The first attempt counts, so 5 means up to
    /// 4 retries.
    pub max_attempts: u32,

    /// Base delay for randomised exponential backoff, in milliseconds.
    /// Default: 1000. Doubles per attempt up to [`Self::retry_max_delay_ms`].
    pub retry_base_delay_ms: u64,

    /// Backoff ceiling in milliseconds. Default: 60 000.
    pub retry_max_delay_ms: u64,

    /// Number of worklist items processed at once. Default: 1.
    ///
    /// Sequential processing is the correctness baseline: output order is
    /// reproducible and a local model serialises requests anyway. Raise this
    /// only when the backend can actually serve parallel requests; the pool
    /// is bounded, never fan-out-per-item.
    pub concurrency: usize,

    /// Directory where per-item text files land. Default: `output`.
    /// Created on demand; files are overwritten on rerun.
    pub output_dir: PathBuf,

    /// TCP connect timeout for image and manifest requests, in
    /// milliseconds. Default: 3050.
    pub connect_timeout_ms: u64,

    /// Whole-request timeout for image and manifest requests, in seconds.
    /// Default: 30. No call waits indefinitely.
    pub fetch_timeout_secs: u64,

    /// Whole-request timeout for a single model call, in seconds.
    /// Default: 120. Vision inference on CPU can be slow; still bounded.
    pub api_timeout_secs: u64,

    /// Repository root used to build IIIF presentation manifest URLs from
    /// bare PIDs (metadata-dir mode):
    /// `{repository_base}/iiif/presentation/{pid}/manifest.json`.
    pub repository_base: String,

    /// JSON field holding the persistent identifier in metadata files.
    pub metadata_pid_field: String,
}

impl Default for TranscribeConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            sampling: SamplingOptions::default(),
            system_prompt: None,
            max_attempts: 5,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            concurrency: 1,
            output_dir: PathBuf::from("output"),
            connect_timeout_ms: 3_050,
            fetch_timeout_secs: 30,
            api_timeout_secs: 120,
            repository_base: "https://repository.library.brown.edu".to_string(),
            metadata_pid_field: DEFAULT_PID_FIELD.to_string(),
        }
    }
}

impl TranscribeConfig {
    /// Create a new builder for `TranscribeConfig`.
    pub fn builder() -> TranscribeConfigBuilder {
        TranscribeConfigBuilder {
            config: Self::default(),
        }
    }

    /// Retry policy shared by the fetcher and the model client.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            self.retry_base_delay_ms,
            self.retry_max_delay_ms,
        )
    }

    /// Effective system prompt: the override if set, else the default.
    pub fn system_prompt(&self) -> &str {
        self.system_prompt
            .as_deref()
            .unwrap_or(crate::prompts::DEFAULT_SYSTEM_PROMPT)
    }
}

/// Builder for [`TranscribeConfig`].
#[derive(Debug)]
pub struct TranscribeConfigBuilder {
    config: TranscribeConfig,
}

impl TranscribeConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.sampling.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.config.sampling.top_p = p.clamp(0.0, 1.0);
        self
    }

    pub fn seed(mut self, seed: Option<i64>) -> Self {
        self.config.sampling.seed = seed;
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.config.sampling.max_tokens = n.max(1);
        self
    }

    pub fn stop_sequences(mut self, stop: Vec<String>) -> Self {
        self.config.sampling.stop = stop;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_base_delay_ms = ms;
        self
    }

    pub fn retry_max_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_max_delay_ms = ms;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn repository_base(mut self, base: impl Into<String>) -> Self {
        self.config.repository_base = base.into();
        self
    }

    pub fn metadata_pid_field(mut self, field: impl Into<String>) -> Self {
        self.config.metadata_pid_field = field.into();
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<TranscribeConfig, TranscribeError> {
        let c = &self.config;
        if c.model.trim().is_empty() {
            return Err(TranscribeError::InvalidConfig(
                "Model identifier must not be empty".into(),
            ));
        }
        if c.base_url.trim().is_empty() {
            return Err(TranscribeError::InvalidConfig(
                "Base URL must not be empty".into(),
            ));
        }
        if c.concurrency == 0 {
            return Err(TranscribeError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.max_attempts == 0 {
            return Err(TranscribeError::InvalidConfig(
                "Max attempts must be ≥ 1".into(),
            ));
        }
        if c.fetch_timeout_secs == 0 || c.api_timeout_secs == 0 {
            return Err(TranscribeError::InvalidConfig(
                "Timeouts must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_deterministic_decoding() {
        let c = TranscribeConfig::default();
        assert_eq!(c.sampling.temperature, 0.0);
        assert_eq!(c.sampling.top_p, 0.05);
        assert_eq!(c.sampling.max_tokens, 1048);
        assert!(c.sampling.seed.is_some());
        assert_eq!(c.concurrency, 1);
    }

    #[test]
    fn builder_clamps_sampling() {
        let c = TranscribeConfig::builder()
            .temperature(5.0)
            .top_p(2.0)
            .concurrency(0)
            .build()
            .unwrap();
        assert_eq!(c.sampling.temperature, 2.0);
        assert_eq!(c.sampling.top_p, 1.0);
        assert_eq!(c.concurrency, 1);
    }

    #[test]
    fn empty_model_rejected() {
        let err = TranscribeConfig::builder().model("  ").build();
        assert!(matches!(err, Err(TranscribeError::InvalidConfig(_))));
    }

    #[test]
    fn retry_policy_mirrors_config() {
        let c = TranscribeConfig::builder()
            .max_attempts(3)
            .retry_base_delay_ms(200)
            .build()
            .unwrap();
        let p = c.retry_policy();
        assert_eq!(p.max_attempts, 3);
    }
}
