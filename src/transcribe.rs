//! Per-item pipeline execution: Fetch → Encode → Transcribe → Write.
//!
//! [`process_item`] always returns an [`ItemResult`], never an `Err`: any
//! stage failure is captured into a Failed result at this boundary so one
//! bad image can never abort a batch. [`transcribe_single`] is the
//! one-URL entry point behind the CLI's single-image mode.

use crate::config::TranscribeConfig;
use crate::error::ItemError;
use crate::manifest::{extract_identifier, ImageReference};
use crate::output::{ItemResult, ItemStatus};
use crate::pipeline::model::{transcribe, TranscriptionRequest, VisionBackend};
use crate::pipeline::{encode, fetch};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Output file path for an identifier, with path-hostile characters
/// replaced so a repository PID can never escape the output directory.
pub fn output_path(dir: &Path, identifier: &str) -> PathBuf {
    let safe: String = identifier
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    dir.join(format!("{safe}.txt"))
}

/// Write a transcription atomically: temp file in the same directory, then
/// rename. Reruns overwrite the previous file; an interrupted write never
/// leaves a half-written transcription behind.
pub async fn write_transcription(
    dir: &Path,
    identifier: &str,
    text: &str,
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;

    let path = output_path(dir, identifier);
    let tmp_path = path.with_extension("txt.tmp");
    tokio::fs::write(&tmp_path, text).await?;
    tokio::fs::rename(&tmp_path, &path).await?;

    Ok(path)
}

/// Run the full pipeline for one worklist item.
///
/// `write_output = false` keeps the transcription in memory only (used by
/// single-image mode when no identifier can be derived from the URL).
pub async fn process_item(
    http: &reqwest::Client,
    backend: &dyn VisionBackend,
    reference: &ImageReference,
    config: &TranscribeConfig,
    write_output: bool,
) -> ItemResult {
    let start = Instant::now();
    let policy = config.retry_policy();
    let mut retries = 0u32;

    info!(
        identifier = %reference.identifier,
        url = %reference.url,
        "fetching image"
    );
    let raw = match fetch::fetch_image(http, &reference.url, &policy).await {
        Ok((raw, fetch_retries)) => {
            retries += fetch_retries;
            raw
        }
        Err(e) => return failed(reference, e, retries, start),
    };

    let encoded = match encode::encode_image(&raw) {
        Ok(img) => img,
        Err(e) => return failed(reference, e, retries, start),
    };
    drop(raw);

    info!(identifier = %reference.identifier, "transcribing image");
    let request = TranscriptionRequest::from_config(encoded, config);
    let (reply, model_retries) = match transcribe(backend, &request, &policy).await {
        Ok(v) => v,
        Err(e) => return failed(reference, e, retries, start),
    };
    retries += model_retries;

    let output_path = if write_output {
        match write_transcription(&config.output_dir, &reference.identifier, &reply.text).await {
            Ok(path) => {
                info!(identifier = %reference.identifier, path = %path.display(), "transcription saved");
                Some(path)
            }
            Err(e) => {
                return failed(
                    reference,
                    ItemError::Write {
                        path: output_path(&config.output_dir, &reference.identifier)
                            .display()
                            .to_string(),
                        detail: e.to_string(),
                    },
                    retries,
                    start,
                )
            }
        }
    } else {
        None
    };

    ItemResult {
        identifier: reference.identifier.clone(),
        url: reference.url.clone(),
        text: reply.text,
        status: ItemStatus::Done,
        truncated: reply.truncated,
        retries,
        prompt_tokens: reply.prompt_tokens,
        output_tokens: reply.output_tokens,
        duration_ms: start.elapsed().as_millis() as u64,
        output_path,
        error: None,
    }
}

fn failed(reference: &ImageReference, error: ItemError, retries: u32, start: Instant) -> ItemResult {
    warn!(
        identifier = %reference.identifier,
        url = %reference.url,
        kind = error.kind(),
        error = %error,
        "item failed"
    );
    ItemResult::failed(
        reference.identifier.as_str(),
        reference.url.as_str(),
        error,
        retries,
        start.elapsed().as_millis() as u64,
    )
}

/// Transcribe a single image URL.
///
/// The identifier is derived from the URL when possible and the result is
/// written under the configured output directory. When the URL carries no
/// recognisable identifier the text is returned in the result only
/// (`output_path` is `None`) and the caller decides where it goes.
pub async fn transcribe_single(
    url: &str,
    config: &TranscribeConfig,
    backend: &dyn VisionBackend,
) -> Result<ItemResult, crate::TranscribeError> {
    let http = fetch::build_client(config)?;

    let derived = extract_identifier(url);
    if derived.is_none() {
        warn!(url, "no identifier found in URL; transcription will not be written to a file");
    }
    let reference = ImageReference {
        identifier: derived.clone().unwrap_or_else(|| "untitled".to_string()),
        url: url.to_string(),
    };

    Ok(process_item(&http, backend, &reference, config, derived.is_some()).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_sanitises_pids() {
        let dir = Path::new("/tmp/out");
        assert_eq!(
            output_path(dir, "bdr:318842"),
            PathBuf::from("/tmp/out/bdr_318842.txt")
        );
        assert_eq!(
            output_path(dir, "../escape"),
            PathBuf::from("/tmp/out/.._escape.txt")
        );
    }

    #[tokio::test]
    async fn write_is_atomic_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_transcription(dir.path(), "318842", "first run")
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "first run");

        let second = write_transcription(dir.path(), "318842", "second run")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "second run");

        // No temp droppings left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn write_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        let path = write_transcription(&nested, "1", "text").await.unwrap();
        assert!(path.exists());
    }
}
