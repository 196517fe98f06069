//! # iiif2txt
//!
//! Transcribe scanned manuscripts from IIIF repositories using a local
//! vision language model.
//!
//! ## Why this crate?
//!
//! Classical OCR engines collapse on early 20th-century handwriting: the
//! letterforms are idiosyncratic, the spelling is deliberately archaic, and
//! training data is scarce. A vision language model reads the page the way
//! a human transcriber would. This crate feeds it IIIF-served page images
//! with fully deterministic decoding, so a rerun over the same collection
//! reproduces the same text byte for byte.
//!
//! ## Pipeline Overview
//!
//! ```text
//! manifest / metadata dir
//!  │
//!  ├─ 1. Resolve   ordered worklist of (identifier, image URL)
//!  ├─ 2. Fetch     image bytes over HTTP with retry/backoff
//!  ├─ 3. Encode    bytes → base64 payload (format sniffed, not trusted)
//!  ├─ 4. Model     Ollama /api/chat, temperature 0, stop sequences
//!  └─ 5. Write     one {identifier}.txt per image, atomic overwrite
//! ```
//!
//! Failures are isolated per item: a page that 404s or a model call that
//! exhausts its retries becomes a Failed entry in the summary while the
//! rest of the batch proceeds. Only a missing worklist aborts the run.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use iiif2txt::{run_batch, CancelFlag, ManifestSource, OllamaBackend, TranscribeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TranscribeConfig::default();
//!     let backend = OllamaBackend::from_config(&config)?;
//!     let source = ManifestSource::parse(
//!         "https://repository.library.brown.edu/iiif/presentation/bdr:425350/manifest.json",
//!     );
//!     let output = run_batch(&source, &config, &backend, &CancelFlag::new(), None).await?;
//!     eprintln!(
//!         "{}/{} transcribed, {} failed",
//!         output.summary.done, output.summary.total, output.summary.failed
//!     );
//!     std::process::exit(output.exit_code());
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `iiif2txt` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! iiif2txt = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod config;
pub mod error;
pub mod manifest;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod transcribe;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{run_batch, CancelFlag};
pub use config::{SamplingOptions, TranscribeConfig, TranscribeConfigBuilder};
pub use error::{ItemError, TranscribeError};
pub use manifest::{ImageReference, ManifestSource};
pub use output::{BatchOutput, BatchSummary, ItemResult, ItemStatus};
pub use pipeline::model::{ModelReply, OllamaBackend, TranscriptionRequest, VisionBackend};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use retry::RetryPolicy;
pub use transcribe::transcribe_single;
