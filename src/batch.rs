//! Batch orchestration across a manifest-derived worklist.
//!
//! Per item the pipeline is `Fetch → Encode → Transcribe → Write`, executed
//! by [`crate::transcribe::process_item`], which converts every stage
//! failure into a Failed result. This module owns the schedule around it:
//!
//! * **Sequential baseline** (`concurrency == 1`, the default): items run
//!   one at a time in worklist order. Always available; reproducible.
//! * **Bounded pool** (`concurrency > 1`): `buffer_unordered(n)` over the
//!   worklist. Never unbounded fan-out; a local model backend and a
//!   rate-limited image host both punish that. One worker's failure never
//!   cancels its siblings.
//!
//! Results are re-ordered to worklist order before the summary is built,
//! so callers see the same shape regardless of scheduling.
//!
//! Cancellation: a [`CancelFlag`] is checked before each item launches.
//! Once set, no new items start; in-flight items run to completion within
//! their own request timeouts, and everything already written stays on
//! disk.

use crate::config::TranscribeConfig;
use crate::manifest::{resolve_worklist, ImageReference, ManifestSource};
use crate::output::{BatchOutput, ItemStatus};
use crate::pipeline::fetch;
use crate::pipeline::model::VisionBackend;
use crate::progress::ProgressCallback;
use crate::transcribe::process_item;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Cooperative cancellation signal shared between the orchestrator and an
/// operator-facing handler (Ctrl-C in the CLI).
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Resolve the worklist and transcribe every item.
///
/// Only worklist resolution and output-directory creation can fail the
/// run; item failures are recorded in the results and reflected in the
/// summary. The returned [`BatchOutput::exit_code`] implements the process
/// exit contract (0 / 1 / 130).
pub async fn run_batch(
    source: &ManifestSource,
    config: &TranscribeConfig,
    backend: &dyn VisionBackend,
    cancel: &CancelFlag,
    progress: Option<ProgressCallback>,
) -> Result<BatchOutput, crate::TranscribeError> {
    let start = Instant::now();
    let http = fetch::build_client(config)?;

    let worklist = resolve_worklist(&http, source, config).await?;
    let total = worklist.len();
    info!(total, "worklist resolved");

    if total > 0 {
        // Fail before any model call if the output directory is unusable.
        tokio::fs::create_dir_all(&config.output_dir)
            .await
            .map_err(|e| crate::TranscribeError::OutputWriteFailed {
                path: config.output_dir.clone(),
                source: e,
            })?;
    }

    if let Some(ref cb) = progress {
        cb.on_batch_start(total);
    }

    let results = if config.concurrency <= 1 {
        run_sequential(&http, backend, &worklist, config, cancel, progress.as_ref()).await
    } else {
        run_concurrent(&http, backend, &worklist, config, cancel, progress.as_ref()).await
    };

    let interrupted = cancel.is_cancelled();
    if interrupted {
        warn!(
            launched = results.len(),
            total, "batch interrupted; already-written results are preserved"
        );
    }

    let output = BatchOutput::new(results, total, interrupted, start.elapsed().as_millis() as u64);

    if let Some(ref cb) = progress {
        cb.on_batch_complete(total, output.summary.done);
    }
    info!(
        done = output.summary.done,
        failed = output.summary.failed,
        truncated = output.summary.truncated,
        duration_ms = output.summary.duration_ms,
        "batch complete"
    );
    if !output.summary.failed_identifiers.is_empty() {
        warn!(
            failed = ?output.summary.failed_identifiers,
            "failed items (retry selectively)"
        );
    }

    Ok(output)
}

async fn run_sequential(
    http: &reqwest::Client,
    backend: &dyn VisionBackend,
    worklist: &[ImageReference],
    config: &TranscribeConfig,
    cancel: &CancelFlag,
    progress: Option<&ProgressCallback>,
) -> Vec<crate::output::ItemResult> {
    let total = worklist.len();
    let mut results = Vec::with_capacity(total);

    for (idx, reference) in worklist.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        let position = idx + 1;
        if let Some(cb) = progress {
            cb.on_item_start(position, total, &reference.identifier);
        }

        let result = process_item(http, backend, reference, config, true).await;

        if let Some(cb) = progress {
            emit_terminal_event(cb, position, total, &result);
        }
        results.push(result);
    }

    results
}

async fn run_concurrent(
    http: &reqwest::Client,
    backend: &dyn VisionBackend,
    worklist: &[ImageReference],
    config: &TranscribeConfig,
    cancel: &CancelFlag,
    progress: Option<&ProgressCallback>,
) -> Vec<crate::output::ItemResult> {
    let total = worklist.len();

    let mut indexed: Vec<(usize, crate::output::ItemResult)> =
        stream::iter(worklist.iter().enumerate().map(|(idx, reference)| {
            let position = idx + 1;
            async move {
                // Checked when the pool polls this future for the first
                // time: queued items never launch after cancellation.
                if cancel.is_cancelled() {
                    return None;
                }
                if let Some(cb) = progress {
                    cb.on_item_start(position, total, &reference.identifier);
                }
                let result = process_item(http, backend, reference, config, true).await;
                if let Some(cb) = progress {
                    emit_terminal_event(cb, position, total, &result);
                }
                Some((idx, result))
            }
        }))
        .buffer_unordered(config.concurrency)
        .filter_map(|r| async move { r })
        .collect()
        .await;

    // Completion order is arbitrary under the pool; summaries and callers
    // expect worklist order.
    indexed.sort_by_key(|(idx, _)| *idx);
    indexed.into_iter().map(|(_, r)| r).collect()
}

fn emit_terminal_event(
    cb: &ProgressCallback,
    position: usize,
    total: usize,
    result: &crate::output::ItemResult,
) {
    match result.status {
        ItemStatus::Done => {
            cb.on_item_complete(position, total, &result.identifier, result.text.len())
        }
        ItemStatus::Failed => {
            let msg = result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".into());
            cb.on_item_error(position, total, &result.identifier, &msg);
        }
    }
}
