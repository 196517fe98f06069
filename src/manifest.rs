//! Worklist resolution: IIIF manifests and repository metadata exports.
//!
//! A batch run starts from one of three sources:
//!
//! * a IIIF Presentation manifest URL,
//! * a manifest JSON file on disk,
//! * a directory of repository metadata exports, each naming a persistent
//!   identifier (PID) whose manifest is then fetched from the repository.
//!
//! All three produce the same thing: an ordered list of
//! [`ImageReference`]s. Order is exactly the manifest's own canvas order.
//! No reordering, no deduplication beyond what the source guarantees.
//!
//! An unreachable or malformed source is fatal to the batch: without a
//! worklist there is nothing to do. In metadata-dir mode a single PID whose
//! manifest fails is logged and skipped, because the other PIDs are
//! independent collections.

use crate::error::TranscribeError;
use crate::retry::{retryable_status, RetryPolicy};
use crate::TranscribeConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// One worklist entry: a stable identifier and the image URL it resolves
/// to. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub identifier: String,
    pub url: String,
}

/// Where the worklist comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// IIIF Presentation manifest URL.
    Url(String),
    /// Manifest JSON file on disk.
    File(PathBuf),
    /// Directory of metadata JSON exports carrying PIDs.
    MetadataDir(PathBuf),
}

impl ManifestSource {
    /// Classify a user-supplied string: URL, directory, or file path.
    pub fn parse(input: &str) -> Self {
        if input.starts_with("http://") || input.starts_with("https://") {
            ManifestSource::Url(input.to_string())
        } else {
            let path = PathBuf::from(input);
            if path.is_dir() {
                ManifestSource::MetadataDir(path)
            } else {
                ManifestSource::File(path)
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            ManifestSource::Url(u) => u.clone(),
            ManifestSource::File(p) => p.display().to_string(),
            ManifestSource::MetadataDir(p) => p.display().to_string(),
        }
    }
}

// ── IIIF Presentation v2 shapes (only the fields we read) ────────────────

#[derive(Deserialize)]
struct Manifest {
    sequences: Option<Vec<Sequence>>,
}

#[derive(Deserialize)]
struct Sequence {
    #[serde(default)]
    canvases: Vec<Canvas>,
}

#[derive(Deserialize)]
struct Canvas {
    #[serde(default)]
    images: Vec<ImageAnnotation>,
}

#[derive(Deserialize)]
struct ImageAnnotation {
    resource: Option<Resource>,
}

#[derive(Deserialize)]
struct Resource {
    #[serde(rename = "@id")]
    id: Option<String>,
}

/// Extract image resource URLs from manifest JSON, in canvas order.
///
/// Pure parsing, no I/O. A manifest without a `sequences` array is
/// malformed; empty canvases are merely an empty collection.
pub fn parse_manifest_images(data: &str, source_desc: &str) -> Result<Vec<String>, TranscribeError> {
    let manifest: Manifest =
        serde_json::from_str(data).map_err(|e| TranscribeError::ManifestMalformed {
            source_desc: source_desc.to_string(),
            detail: format!("invalid JSON: {e}"),
        })?;

    let sequences = manifest
        .sequences
        .ok_or_else(|| TranscribeError::ManifestMalformed {
            source_desc: source_desc.to_string(),
            detail: "missing 'sequences'".into(),
        })?;

    let urls: Vec<String> = sequences
        .into_iter()
        .take(1)
        .flat_map(|s| s.canvases)
        .flat_map(|c| c.images)
        .filter_map(|i| i.resource.and_then(|r| r.id))
        .collect();

    Ok(urls)
}

// ── Identifier derivation ────────────────────────────────────────────────

static PID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z]+:(\d+)").unwrap());

/// Pull the numeric part of a `namespace:digits` persistent identifier out
/// of a URL, e.g. `.../iiif/image/bdr:318842/full/...` → `318842`.
///
/// Matching starts after the host so a `host:port` pair can never be
/// mistaken for a PID.
pub fn extract_identifier(url: &str) -> Option<String> {
    let path_start = url
        .find("://")
        .and_then(|i| url[i + 3..].find('/').map(|j| i + 3 + j))
        .unwrap_or(0);

    PID_RE
        .captures(&url[path_start..])
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Derive a reference for each URL: the embedded PID when present, a
/// positional `{label}-{n}` name otherwise. Deterministic either way.
fn to_references(urls: Vec<String>, label: &str) -> Vec<ImageReference> {
    urls.into_iter()
        .enumerate()
        .map(|(i, url)| {
            let identifier =
                extract_identifier(&url).unwrap_or_else(|| format!("{}-{}", label, i + 1));
            ImageReference { identifier, url }
        })
        .collect()
}

/// Collection label used for positional identifiers: the PID embedded in
/// the source description, else its final path segment, else "item".
fn collection_label(source_desc: &str) -> String {
    if let Some(pid) = extract_identifier(source_desc) {
        return pid;
    }
    source_desc
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .map(|s| s.trim_end_matches(".json"))
        .filter(|s| !s.is_empty())
        .unwrap_or("item")
        .to_string()
}

// ── Resolution ───────────────────────────────────────────────────────────

/// Fetch manifest text over HTTP with the shared retry policy.
async fn fetch_manifest_text(
    client: &reqwest::Client,
    url: &str,
    policy: &RetryPolicy,
) -> Result<String, TranscribeError> {
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let transient_detail = match client.get(url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if (200..300).contains(&status) {
                    match resp.text().await {
                        Ok(text) => return Ok(text),
                        Err(e) => format!("body read failed: {e}"),
                    }
                } else if retryable_status(status) {
                    format!("HTTP {status}")
                } else {
                    return Err(TranscribeError::ManifestUnreachable {
                        url: url.to_string(),
                        attempts: attempt,
                        reason: format!("HTTP {status}"),
                    });
                }
            }
            Err(e) => format!("{e}"),
        };

        if !policy.should_retry(attempt) {
            return Err(TranscribeError::ManifestUnreachable {
                url: url.to_string(),
                attempts: attempt,
                reason: transient_detail,
            });
        }

        let backoff = policy.delay(attempt);
        warn!(
            url,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            detail = %transient_detail,
            "transient manifest failure, retrying"
        );
        sleep(backoff).await;
    }
}

/// IIIF presentation manifest URL for a bare PID.
fn manifest_url_for_pid(repository_base: &str, pid: &str) -> String {
    format!(
        "{}/iiif/presentation/{}/manifest.json",
        repository_base.trim_end_matches('/'),
        pid
    )
}

/// Scan a metadata directory for PIDs, in sorted file order.
///
/// Each `*.json` file is expected to carry the configured PID field as an
/// array of strings (a plain string is also accepted). Files that fail to
/// parse or lack the field are logged and skipped; they are repository
/// export noise, not a reason to abort.
fn collect_pids(dir: &Path, field: &str) -> Result<Vec<String>, TranscribeError> {
    if !dir.is_dir() {
        return Err(TranscribeError::ManifestNotFound {
            path: dir.to_path_buf(),
        });
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| TranscribeError::Internal(format!("read_dir {}: {e}", dir.display())))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    let mut pids = Vec::new();
    for file in &files {
        let text = match std::fs::read_to_string(file) {
            Ok(t) => t,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "unreadable metadata file, skipping");
                continue;
            }
        };
        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "invalid JSON in metadata file, skipping");
                continue;
            }
        };
        let pid = match &value[field] {
            serde_json::Value::Array(items) => {
                items.first().and_then(|v| v.as_str()).map(String::from)
            }
            serde_json::Value::String(s) => Some(s.clone()),
            _ => None,
        };
        match pid {
            Some(pid) => pids.push(pid),
            None => debug!(file = %file.display(), field, "no PID in metadata file"),
        }
    }

    info!(count = pids.len(), dir = %dir.display(), "collected PIDs from metadata");
    Ok(pids)
}

/// Resolve a manifest source into the ordered worklist.
///
/// Fatal on an unreachable or malformed primary source. In metadata-dir
/// mode, individual PID manifests that fail are skipped with a warning.
pub async fn resolve_worklist(
    client: &reqwest::Client,
    source: &ManifestSource,
    config: &TranscribeConfig,
) -> Result<Vec<ImageReference>, TranscribeError> {
    let policy = config.retry_policy();

    match source {
        ManifestSource::Url(url) => {
            info!(url, "resolving manifest");
            let text = fetch_manifest_text(client, url, &policy).await?;
            let urls = parse_manifest_images(&text, url)?;
            Ok(to_references(urls, &collection_label(url)))
        }

        ManifestSource::File(path) => {
            if !path.is_file() {
                return Err(TranscribeError::ManifestNotFound { path: path.clone() });
            }
            let text = std::fs::read_to_string(path).map_err(|e| {
                TranscribeError::Internal(format!("read {}: {e}", path.display()))
            })?;
            let desc = path.display().to_string();
            let urls = parse_manifest_images(&text, &desc)?;
            Ok(to_references(urls, &collection_label(&desc)))
        }

        ManifestSource::MetadataDir(dir) => {
            let pids = collect_pids(dir, &config.metadata_pid_field)?;
            if pids.is_empty() {
                return Err(TranscribeError::NoIdentifiers {
                    dir: dir.clone(),
                    field: config.metadata_pid_field.clone(),
                });
            }

            let mut refs = Vec::new();
            for pid in &pids {
                let url = manifest_url_for_pid(&config.repository_base, pid);
                let text = match fetch_manifest_text(client, &url, &policy).await {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(pid, error = %e, "manifest fetch failed, skipping PID");
                        continue;
                    }
                };
                let urls = match parse_manifest_images(&text, &url) {
                    Ok(u) => u,
                    Err(e) => {
                        warn!(pid, error = %e, "malformed manifest, skipping PID");
                        continue;
                    }
                };
                if urls.is_empty() {
                    warn!(pid, "no images in manifest, skipping PID");
                    continue;
                }
                info!(pid, images = urls.len(), "resolved manifest");
                refs.extend(to_references(urls, pid));
            }
            Ok(refs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_json(urls: &[&str]) -> String {
        let canvases: Vec<serde_json::Value> = urls
            .iter()
            .map(|u| {
                serde_json::json!({
                    "images": [{ "resource": { "@id": u } }]
                })
            })
            .collect();
        serde_json::json!({ "sequences": [{ "canvases": canvases }] }).to_string()
    }

    #[test]
    fn manifest_order_is_preserved() {
        let data = manifest_json(&[
            "https://repo.test/iiif/image/bdr:1/full/max/0/default.jpg",
            "https://repo.test/iiif/image/bdr:2/full/max/0/default.jpg",
            "https://repo.test/iiif/image/bdr:3/full/max/0/default.jpg",
        ]);
        let urls = parse_manifest_images(&data, "test").unwrap();
        assert_eq!(urls.len(), 3);
        assert!(urls[0].contains("bdr:1"));
        assert!(urls[1].contains("bdr:2"));
        assert!(urls[2].contains("bdr:3"));
    }

    #[test]
    fn missing_sequences_is_malformed() {
        let err = parse_manifest_images(r#"{"label": "no sequences here"}"#, "test").unwrap_err();
        match err {
            TranscribeError::ManifestMalformed { detail, .. } => {
                assert!(detail.contains("sequences"))
            }
            other => panic!("expected ManifestMalformed, got {other:?}"),
        }
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(matches!(
            parse_manifest_images("not json", "test"),
            Err(TranscribeError::ManifestMalformed { .. })
        ));
    }

    #[test]
    fn canvases_without_resources_are_skipped() {
        let data = serde_json::json!({
            "sequences": [{ "canvases": [
                { "images": [] },
                { "images": [{ "resource": { "@id": "https://repo.test/x.jpg" } }] },
                { "images": [{ }] }
            ]}]
        })
        .to_string();
        let urls = parse_manifest_images(&data, "test").unwrap();
        assert_eq!(urls, vec!["https://repo.test/x.jpg".to_string()]);
    }

    #[test]
    fn identifier_from_iiif_url() {
        assert_eq!(
            extract_identifier(
                "https://repository.library.brown.edu/iiif/image/bdr:318842/full/max/0/default.jpg"
            ),
            Some("318842".to_string())
        );
        assert_eq!(extract_identifier("https://example.org/plain.jpg"), None);
    }

    #[test]
    fn identifier_ignores_host_port() {
        assert_eq!(
            extract_identifier("http://localhost:8080/iiif/image/bdr:7/full/max/0/default.jpg"),
            Some("7".to_string())
        );
        assert_eq!(extract_identifier("http://localhost:8080/manifest.json"), None);
    }

    #[test]
    fn positional_fallback_is_deterministic() {
        let refs = to_references(
            vec![
                "https://example.org/a.jpg".into(),
                "https://example.org/b.jpg".into(),
            ],
            "letters",
        );
        assert_eq!(refs[0].identifier, "letters-1");
        assert_eq!(refs[1].identifier, "letters-2");
    }

    #[test]
    fn source_classification() {
        assert_eq!(
            ManifestSource::parse("https://repo.test/manifest.json"),
            ManifestSource::Url("https://repo.test/manifest.json".into())
        );
        assert!(matches!(
            ManifestSource::parse("/nonexistent/manifest.json"),
            ManifestSource::File(_)
        ));
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ManifestSource::parse(dir.path().to_str().unwrap()),
            ManifestSource::MetadataDir(_)
        ));
    }

    #[test]
    fn pid_url_template() {
        assert_eq!(
            manifest_url_for_pid("https://repository.library.brown.edu/", "bdr:318842"),
            "https://repository.library.brown.edu/iiif/presentation/bdr:318842/manifest.json"
        );
    }

    #[test]
    fn collect_pids_reads_field_and_skips_noise() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"mods_id_bdr_pid_ssim": ["bdr:100"]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("b.json"), "not json at all").unwrap();
        std::fs::write(
            dir.path().join("c.json"),
            r#"{"mods_id_bdr_pid_ssim": ["bdr:300"]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "x").unwrap();

        let pids = collect_pids(dir.path(), "mods_id_bdr_pid_ssim").unwrap();
        assert_eq!(pids, vec!["bdr:100".to_string(), "bdr:300".to_string()]);
    }

    #[tokio::test]
    async fn resolve_url_source_end_to_end() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let body = manifest_json(&[
            "https://repo.test/iiif/image/bdr:11/full/max/0/default.jpg",
            "https://repo.test/iiif/image/bdr:12/full/max/0/default.jpg",
        ]);
        Mock::given(method("GET"))
            .and(path("/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let config = TranscribeConfig::builder()
            .max_attempts(2)
            .retry_base_delay_ms(1)
            .build()
            .unwrap();
        let client = crate::pipeline::fetch::build_client(&config).unwrap();
        let source = ManifestSource::Url(format!("{}/manifest.json", server.uri()));

        let refs = resolve_worklist(&client, &source, &config).await.unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].identifier, "11");
        assert_eq!(refs[1].identifier, "12");
    }

    #[tokio::test]
    async fn unreachable_manifest_is_fatal() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let config = TranscribeConfig::builder()
            .max_attempts(2)
            .retry_base_delay_ms(1)
            .build()
            .unwrap();
        let client = crate::pipeline::fetch::build_client(&config).unwrap();
        let source = ManifestSource::Url(format!("{}/manifest.json", server.uri()));

        let err = resolve_worklist(&client, &source, &config).await.unwrap_err();
        assert!(matches!(err, TranscribeError::ManifestUnreachable { .. }));
    }
}
