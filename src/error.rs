//! Error types for the iiif2txt library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`TranscribeError`] — **Fatal**: the run cannot proceed at all
//!   (unreachable manifest, malformed worklist source, unwritable output
//!   directory). Returned as `Err(TranscribeError)` from the top-level
//!   entry points.
//!
//! * [`ItemError`] — **Non-fatal**: a single worklist item failed (image
//!   unreachable, undecodable bytes, model call exhausted its retries) but
//!   every other item is unaffected. Stored inside
//!   [`crate::output::ItemResult`] so callers can inspect partial success
//!   rather than losing the whole batch to one bad page.
//!
//! The separation enforces the propagation policy: item-level errors are
//! caught at the per-item boundary and converted into a Failed result; only
//! a missing worklist aborts the batch.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the iiif2txt library.
///
/// Item-level failures use [`ItemError`] and are stored in
/// [`crate::output::ItemResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum TranscribeError {
    // ── Manifest errors ───────────────────────────────────────────────────
    /// The manifest (or metadata source) could not be retrieved.
    #[error("Failed to fetch manifest '{url}' after {attempts} attempts: {reason}\nCheck the URL and your network connection.")]
    ManifestUnreachable {
        url: String,
        attempts: u32,
        reason: String,
    },

    /// The manifest was retrieved but is not valid JSON or is missing
    /// required fields.
    #[error("Malformed manifest '{source_desc}': {detail}")]
    ManifestMalformed { source_desc: String, detail: String },

    /// A local manifest or metadata path does not exist.
    #[error("Manifest source not found: '{path}'\nCheck the path exists and is readable.")]
    ManifestNotFound { path: PathBuf },

    /// The metadata directory was scanned but produced no identifiers.
    #[error("No identifiers found in metadata directory '{dir}'\nExpected JSON files carrying a '{field}' field.")]
    NoIdentifiers { dir: PathBuf, field: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create the output directory or write a transcription file.
    #[error("Failed to write output '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single worklist item.
///
/// Stored on [`crate::output::ItemResult`] when an item fails. The batch
/// continues unless the worklist itself cannot be resolved.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum ItemError {
    /// Transient network failure fetching the image; retries exhausted.
    #[error("Fetch failed for '{url}' after {attempts} attempts: {detail}")]
    Network {
        url: String,
        attempts: u32,
        detail: String,
    },

    /// Permanent HTTP client error (4xx) fetching the image; not retried.
    #[error("Image request for '{url}' rejected with HTTP {status}")]
    Fetch { url: String, status: u16 },

    /// Fetched bytes are empty or not a recognisable image format.
    #[error("Cannot encode image: {detail}")]
    Encoding { detail: String },

    /// The model endpoint is unreachable (connection refused or timed out
    /// before a response). Distinct from [`ItemError::ModelMissing`] so the
    /// operator knows whether to start the server or pull the model.
    #[error("Vision model endpoint unreachable at '{base_url}': {detail}\nIs the server running? Try: ollama serve")]
    ModelUnavailable { base_url: String, detail: String },

    /// The endpoint answered but does not have the requested model.
    #[error("Model '{model}' not found on the backend.\nTry: ollama pull {model}")]
    ModelMissing { model: String },

    /// The model call failed after retries (malformed reply, server error).
    #[error("Model call failed after {attempts} attempts: {detail}")]
    Model { attempts: u32, detail: String },

    /// The model returned an empty or degenerate transcription.
    #[error("Model returned no usable text: {detail}")]
    Validation { detail: String },

    /// The transcription file could not be written.
    #[error("Failed to write '{path}': {detail}")]
    Write { path: String, detail: String },
}

impl ItemError {
    /// Short machine-readable kind, used in logs and the JSON summary.
    pub fn kind(&self) -> &'static str {
        match self {
            ItemError::Network { .. } => "network",
            ItemError::Fetch { .. } => "fetch",
            ItemError::Encoding { .. } => "encoding",
            ItemError::ModelUnavailable { .. } => "model-unavailable",
            ItemError::ModelMissing { .. } => "model-missing",
            ItemError::Model { .. } => "model",
            ItemError::Validation { .. } => "validation",
            ItemError::Write { .. } => "write",
        }
    }
}
