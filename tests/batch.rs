//! End-to-end batch tests against mock HTTP servers and fake backends.
//!
//! The image host and the Ollama endpoint are wiremock servers; the model
//! is either a deterministic fake implementing `VisionBackend` or the real
//! `OllamaBackend` pointed at the mock. No network, no model weights.

use async_trait::async_trait;
use iiif2txt::{
    run_batch, CancelFlag, ItemError, ItemStatus, ManifestSource, ModelReply, OllamaBackend,
    TranscribeConfig, TranscribeError, TranscriptionRequest, VisionBackend,
};
use image::{DynamicImage, Rgba, RgbaImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ── Test helpers ─────────────────────────────────────────────────────────────

/// A tiny PNG whose bytes differ per `shade`, so each worklist item has a
/// distinct payload.
fn png_bytes(shade: u8) -> Vec<u8> {
    let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([shade, 0, 0, 255])));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .expect("png encode");
    buf
}

fn b64(bytes: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.encode(bytes)
}

/// IIIF Presentation v2 manifest whose canvases point at `urls`, in order.
fn manifest_json(urls: &[String]) -> String {
    let canvases: Vec<serde_json::Value> = urls
        .iter()
        .map(|u| serde_json::json!({ "images": [{ "resource": { "@id": u } }] }))
        .collect();
    serde_json::json!({ "sequences": [{ "canvases": canvases }] }).to_string()
}

/// Deterministic fake: maps a base64 payload to canned text, optionally
/// failing for specific payloads.
struct FakeBackend {
    replies: HashMap<String, String>,
    fail_payloads: Vec<String>,
}

impl FakeBackend {
    fn new() -> Self {
        Self {
            replies: HashMap::new(),
            fail_payloads: Vec::new(),
        }
    }

    fn reply(mut self, image: &[u8], text: &str) -> Self {
        self.replies.insert(b64(image), text.to_string());
        self
    }

    fn fail_for(mut self, image: &[u8]) -> Self {
        self.fail_payloads.push(b64(image));
        self
    }
}

#[async_trait]
impl VisionBackend for FakeBackend {
    async fn submit(&self, request: &TranscriptionRequest) -> Result<ModelReply, ItemError> {
        if self.fail_payloads.contains(&request.image.data) {
            return Err(ItemError::Model {
                attempts: 1,
                detail: "canned failure".into(),
            });
        }
        let text = self
            .replies
            .get(&request.image.data)
            .cloned()
            .unwrap_or_else(|| "unrecognised page".to_string());
        Ok(ModelReply {
            text,
            truncated: false,
            prompt_tokens: 10,
            output_tokens: 5,
        })
    }
}

/// Config pointing the output at a temp dir, with fast retries.
fn test_config(output_dir: &Path) -> TranscribeConfig {
    TranscribeConfig::builder()
        .output_dir(output_dir)
        .max_attempts(2)
        .retry_base_delay_ms(1)
        .retry_max_delay_ms(5)
        .build()
        .expect("valid config")
}

/// Mount a manifest of `n` images on `server` and return the image bytes
/// per item, mounting each image route too.
async fn mount_collection(server: &MockServer, pids: &[u32]) -> Vec<Vec<u8>> {
    let urls: Vec<String> = pids
        .iter()
        .map(|pid| format!("{}/iiif/image/bdr:{pid}/full/max/0/default.jpg", server.uri()))
        .collect();

    Mock::given(method("GET"))
        .and(path("/manifest.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(manifest_json(&urls)))
        .mount(server)
        .await;

    let mut images = Vec::new();
    for (i, pid) in pids.iter().enumerate() {
        let bytes = png_bytes(i as u8 + 1);
        Mock::given(method("GET"))
            .and(path(format!("/iiif/image/bdr:{pid}/full/max/0/default.jpg")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(bytes.clone()),
            )
            .mount(server)
            .await;
        images.push(bytes);
    }
    images
}

fn manifest_source(server: &MockServer) -> ManifestSource {
    ManifestSource::Url(format!("{}/manifest.json", server.uri()))
}

// ── Orchestrator properties ──────────────────────────────────────────────────

#[tokio::test]
async fn every_item_yields_exactly_one_result_in_manifest_order() {
    let server = MockServer::start().await;
    let images = mount_collection(&server, &[11, 12, 13]).await;

    let out_dir = tempfile::tempdir().unwrap();
    let config = test_config(out_dir.path());
    let backend = FakeBackend::new()
        .reply(&images[0], "page one")
        .reply(&images[1], "page two")
        .reply(&images[2], "page three");

    let output = run_batch(
        &manifest_source(&server),
        &config,
        &backend,
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    let ids: Vec<&str> = output.results.iter().map(|r| r.identifier.as_str()).collect();
    assert_eq!(ids, vec!["11", "12", "13"]);
    assert_eq!(output.summary.total, 3);
    assert_eq!(output.summary.done, 3);
    assert_eq!(output.summary.failed, 0);
    assert_eq!(output.exit_code(), 0);
}

#[tokio::test]
async fn concurrent_pool_preserves_result_order() {
    let server = MockServer::start().await;
    let images = mount_collection(&server, &[1, 2, 3, 4, 5]).await;

    let out_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(out_dir.path());
    config.concurrency = 4;

    let mut backend = FakeBackend::new();
    for (i, img) in images.iter().enumerate() {
        backend = backend.reply(img, &format!("text {}", i + 1));
    }

    let output = run_batch(
        &manifest_source(&server),
        &config,
        &backend,
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    let ids: Vec<&str> = output.results.iter().map(|r| r.identifier.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3", "4", "5"]);
    assert_eq!(output.summary.done, 5);
}

#[tokio::test]
async fn item_failure_is_isolated_and_sets_exit_code_one() {
    let server = MockServer::start().await;
    let pids = [21, 22, 23, 24, 25];
    let urls: Vec<String> = pids
        .iter()
        .map(|pid| format!("{}/iiif/image/bdr:{pid}/full/max/0/default.jpg", server.uri()))
        .collect();
    Mock::given(method("GET"))
        .and(path("/manifest.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(manifest_json(&urls)))
        .mount(&server)
        .await;

    // Items 1,2,4,5 serve images; item 3 is a hard 404.
    let mut backend = FakeBackend::new();
    for (i, pid) in pids.iter().enumerate() {
        let route = format!("/iiif/image/bdr:{pid}/full/max/0/default.jpg");
        if i == 2 {
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(404))
                .mount(&server)
                .await;
        } else {
            let bytes = png_bytes(i as u8 + 1);
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(
                    ResponseTemplate::new(200)
                        .insert_header("content-type", "image/png")
                        .set_body_bytes(bytes.clone()),
                )
                .mount(&server)
                .await;
            backend = backend.reply(&bytes, &format!("letter {}", i + 1));
        }
    }

    let out_dir = tempfile::tempdir().unwrap();
    let config = test_config(out_dir.path());
    let output = run_batch(
        &manifest_source(&server),
        &config,
        &backend,
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(output.summary.done, 4);
    assert_eq!(output.summary.failed, 1);
    assert_eq!(output.summary.failed_identifiers, vec!["23".to_string()]);
    assert_eq!(output.exit_code(), 1);

    // The failed item carries its error; the others wrote files.
    let failed = &output.results[2];
    assert_eq!(failed.status, ItemStatus::Failed);
    assert!(matches!(failed.error, Some(ItemError::Fetch { status: 404, .. })));
    assert!(out_dir.path().join("21.txt").exists());
    assert!(out_dir.path().join("22.txt").exists());
    assert!(!out_dir.path().join("23.txt").exists());
    assert!(out_dir.path().join("24.txt").exists());
    assert!(out_dir.path().join("25.txt").exists());
}

#[tokio::test]
async fn model_failure_is_isolated_like_fetch_failure() {
    let server = MockServer::start().await;
    let images = mount_collection(&server, &[31, 32, 33]).await;

    let out_dir = tempfile::tempdir().unwrap();
    let config = test_config(out_dir.path());
    let backend = FakeBackend::new()
        .reply(&images[0], "first")
        .fail_for(&images[1])
        .reply(&images[2], "third");

    let output = run_batch(
        &manifest_source(&server),
        &config,
        &backend,
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(output.summary.done, 2);
    assert_eq!(output.summary.failed_identifiers, vec!["32".to_string()]);
    assert!(matches!(
        output.results[1].error,
        Some(ItemError::Model { .. })
    ));
}

#[tokio::test]
async fn rerun_overwrites_with_identical_output() {
    let server = MockServer::start().await;
    let images = mount_collection(&server, &[41]).await;

    let out_dir = tempfile::tempdir().unwrap();
    let config = test_config(out_dir.path());
    let backend = FakeBackend::new().reply(&images[0], "ye antient text");

    for _ in 0..2 {
        let output = run_batch(
            &manifest_source(&server),
            &config,
            &backend,
            &CancelFlag::new(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(output.summary.done, 1);
    }

    let files: Vec<_> = std::fs::read_dir(out_dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(files.len(), 1, "rerun must overwrite, not accumulate");
    assert_eq!(
        std::fs::read_to_string(out_dir.path().join("41.txt")).unwrap(),
        "ye antient text"
    );
}

#[tokio::test]
async fn cancelled_run_launches_nothing_and_exits_130() {
    let server = MockServer::start().await;
    let images = mount_collection(&server, &[51, 52]).await;

    let out_dir = tempfile::tempdir().unwrap();
    let config = test_config(out_dir.path());
    let backend = FakeBackend::new()
        .reply(&images[0], "a")
        .reply(&images[1], "b");

    let cancel = CancelFlag::new();
    cancel.cancel();

    let output = run_batch(&manifest_source(&server), &config, &backend, &cancel, None)
        .await
        .unwrap();

    assert!(output.interrupted);
    assert!(output.results.is_empty());
    assert_eq!(output.summary.total, 2);
    assert_eq!(output.exit_code(), 130);
}

#[tokio::test]
async fn empty_manifest_completes_with_exit_zero() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/manifest.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"sequences": [{"canvases": []}]}"#),
        )
        .mount(&server)
        .await;

    let out_dir = tempfile::tempdir().unwrap();
    let config = test_config(out_dir.path());
    let backend = FakeBackend::new();

    let output = run_batch(
        &manifest_source(&server),
        &config,
        &backend,
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap();
    assert_eq!(output.summary.total, 0);
    assert_eq!(output.exit_code(), 0);
}

#[tokio::test]
async fn malformed_manifest_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/manifest.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"no": "sequences"}"#))
        .mount(&server)
        .await;

    let out_dir = tempfile::tempdir().unwrap();
    let config = test_config(out_dir.path());
    let backend = FakeBackend::new();

    let err = run_batch(
        &manifest_source(&server),
        &config,
        &backend,
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TranscribeError::ManifestMalformed { .. }));
}

// ── Metadata-dir mode ────────────────────────────────────────────────────────

#[tokio::test]
async fn metadata_dir_resolves_pids_then_manifests() {
    let server = MockServer::start().await;

    // Two collections, one page each.
    for (pid, img_pid, shade) in [("bdr:100", 101u32, 7u8), ("bdr:200", 201, 8)] {
        let image_url = format!(
            "{}/iiif/image/bdr:{img_pid}/full/max/0/default.jpg",
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path(format!("/iiif/presentation/{pid}/manifest.json")))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(manifest_json(&[image_url.clone()])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/iiif/image/bdr:{img_pid}/full/max/0/default.jpg")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(png_bytes(shade)),
            )
            .mount(&server)
            .await;
    }

    let metadata_dir = tempfile::tempdir().unwrap();
    std::fs::write(
        metadata_dir.path().join("a.json"),
        r#"{"mods_id_bdr_pid_ssim": ["bdr:100"]}"#,
    )
    .unwrap();
    std::fs::write(
        metadata_dir.path().join("b.json"),
        r#"{"mods_id_bdr_pid_ssim": ["bdr:200"]}"#,
    )
    .unwrap();

    let out_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(out_dir.path());
    config.repository_base = server.uri();

    let backend = FakeBackend::new()
        .reply(&png_bytes(7), "first collection")
        .reply(&png_bytes(8), "second collection");

    let source = ManifestSource::MetadataDir(metadata_dir.path().to_path_buf());
    let output = run_batch(&source, &config, &backend, &CancelFlag::new(), None)
        .await
        .unwrap();

    let ids: Vec<&str> = output.results.iter().map(|r| r.identifier.as_str()).collect();
    assert_eq!(ids, vec!["101", "201"]);
    assert_eq!(output.summary.done, 2);
    assert_eq!(
        std::fs::read_to_string(out_dir.path().join("101.txt")).unwrap(),
        "first collection"
    );
}

// ── Full stack with the real Ollama client against a mock ────────────────────

#[tokio::test]
async fn ollama_backend_end_to_end() {
    let server = MockServer::start().await;
    let _images = mount_collection(&server, &[61]).await;

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "model": "qwen2.5vl:3b",
            "message": {
                "role": "assistant",
                "content": "My dear Kleiner,\nI have yr. letter of the 12th.\n\nNotes: transcription reviewed"
            },
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 900,
            "eval_count": 42
        })))
        .mount(&server)
        .await;

    let out_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(out_dir.path());
    config.base_url = server.uri();
    let backend = OllamaBackend::from_config(&config).unwrap();

    let output = run_batch(
        &manifest_source(&server),
        &config,
        &backend,
        &CancelFlag::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(output.summary.done, 1);
    // The stop marker and everything after it is cut client-side.
    let text = std::fs::read_to_string(out_dir.path().join("61.txt")).unwrap();
    assert_eq!(text, "My dear Kleiner,\nI have yr. letter of the 12th.");
    assert_eq!(output.results[0].prompt_tokens, 900);
}
