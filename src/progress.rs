//! Progress-callback trait for per-item batch events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] into
//! [`crate::batch::run_batch`] to receive real-time events as the pipeline
//! works through the worklist. Callbacks keep the library free of any
//! terminal or UI concern; the CLI forwards these events to an indicatif
//! progress bar, and a server could forward them to a channel instead.
//!
//! When `concurrency > 1`, `on_item_*` may be called from several tasks at
//! once. Implementations must guard shared mutable state accordingly.

use std::sync::Arc;

/// Called by the batch orchestrator as it processes each worklist item.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once after the worklist is resolved, before any item starts.
    fn on_batch_start(&self, total_items: usize) {
        let _ = total_items;
    }

    /// Called just before an item enters the fetch stage.
    ///
    /// `position` is 1-indexed within the worklist.
    fn on_item_start(&self, position: usize, total_items: usize, identifier: &str) {
        let _ = (position, total_items, identifier);
    }

    /// Called when an item's transcription has been written.
    fn on_item_complete(
        &self,
        position: usize,
        total_items: usize,
        identifier: &str,
        text_len: usize,
    ) {
        let _ = (position, total_items, identifier, text_len);
    }

    /// Called when an item fails at any stage.
    fn on_item_error(&self, position: usize, total_items: usize, identifier: &str, error: &str) {
        let _ = (position, total_items, identifier, error);
    }

    /// Called once after the worklist is exhausted or the run is cancelled.
    fn on_batch_complete(&self, total_items: usize, done_count: usize) {
        let _ = (total_items, done_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias for the injected callback type.
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;
