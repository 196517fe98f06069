//! Result types: per-item outcomes and the batch summary.
//!
//! Every worklist item produces exactly one [`ItemResult`], success or
//! failure; the orchestrator never drops an item silently. The
//! [`BatchSummary`] is derived from the results after the worklist drains
//! and carries everything a human needs to retry selectively.

use crate::error::ItemError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Terminal state of one worklist item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Done,
    Failed,
}

/// Outcome of one image: the transcription on success, the captured error
/// on failure. Mirrors the per-page result shape used by VLM page
/// pipelines so callers can inspect partial success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult {
    /// Stable identifier, e.g. a repository PID.
    pub identifier: String,

    /// Source image URL.
    pub url: String,

    /// Transcribed text. Empty on failure.
    pub text: String,

    pub status: ItemStatus,

    /// True when generation hit the max-token cap. The text is kept but a
    /// human should treat it as incomplete.
    pub truncated: bool,

    /// Retries consumed across fetch and model calls.
    pub retries: u32,

    /// Token accounting reported by the backend (0 when unavailable).
    pub prompt_tokens: u64,
    pub output_tokens: u64,

    pub duration_ms: u64,

    /// Where the transcription was written, when it was.
    pub output_path: Option<PathBuf>,

    /// The captured failure. `None` iff `status == Done`.
    pub error: Option<ItemError>,
}

impl ItemResult {
    /// Build a Failed result carrying the captured error.
    pub fn failed(
        identifier: impl Into<String>,
        url: impl Into<String>,
        error: ItemError,
        retries: u32,
        duration_ms: u64,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            url: url.into(),
            text: String::new(),
            status: ItemStatus::Failed,
            truncated: false,
            retries,
            prompt_tokens: 0,
            output_tokens: 0,
            duration_ms,
            output_path: None,
            error: Some(error),
        }
    }
}

/// Aggregate counts for a completed (or interrupted) batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Items in the resolved worklist.
    pub total: usize,
    /// Items that produced a transcription file.
    pub done: usize,
    /// Items that failed at some stage.
    pub failed: usize,
    /// Items whose transcription hit the token cap.
    pub truncated: usize,
    /// Identifiers of failed items, in worklist order, for selective retry.
    pub failed_identifiers: Vec<String>,
    pub duration_ms: u64,
}

/// Everything a batch run returns: ordered per-item results plus the
/// summary. `interrupted` is set when the operator cancelled mid-run;
/// results already produced are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutput {
    pub results: Vec<ItemResult>,
    pub summary: BatchSummary,
    pub interrupted: bool,
}

impl BatchOutput {
    /// Assemble the summary from per-item results.
    ///
    /// `total` is the worklist length, which exceeds `results.len()` when
    /// the run was interrupted before every item launched.
    pub fn new(
        results: Vec<ItemResult>,
        total: usize,
        interrupted: bool,
        duration_ms: u64,
    ) -> Self {
        let done = results
            .iter()
            .filter(|r| r.status == ItemStatus::Done)
            .count();
        let failed = results
            .iter()
            .filter(|r| r.status == ItemStatus::Failed)
            .count();
        let truncated = results.iter().filter(|r| r.truncated).count();
        let failed_identifiers = results
            .iter()
            .filter(|r| r.status == ItemStatus::Failed)
            .map(|r| r.identifier.clone())
            .collect();

        Self {
            results,
            summary: BatchSummary {
                total,
                done,
                failed,
                truncated,
                failed_identifiers,
                duration_ms,
            },
            interrupted,
        }
    }

    /// Process exit code contract: 0 all done, 1 any failure, 130 when the
    /// operator interrupted the run.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            130
        } else if self.summary.failed > 0 {
            1
        } else {
            0
        }
    }
}
