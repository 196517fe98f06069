//! CLI binary for iiif2txt.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `TranscribeConfig`, wires Ctrl-C to the cancel flag, and prints results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iiif2txt::{
    run_batch, transcribe_single, BatchProgressCallback, CancelFlag, ItemStatus, ManifestSource,
    OllamaBackend, ProgressCallback, TranscribeConfig,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a live bar plus one log line per item.
/// Works correctly when items complete out of order (concurrent mode).
struct CliProgressCallback {
    bar: ProgressBar,
    /// Per-item wall-clock start times for elapsed reporting.
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0); // length set in on_batch_start

        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(spinner_style);
        bar.set_prefix("Resolving");
        bar.set_message("Fetching manifest…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} images  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Transcribing");
        self.bar.reset_eta();
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_items: usize) {
        self.activate_bar(total_items);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Transcribing {total_items} images…"))
        ));
    }

    fn on_item_start(&self, position: usize, _total: usize, identifier: &str) {
        self.start_times
            .lock()
            .unwrap()
            .insert(position, Instant::now());
        self.bar.set_message(identifier.to_string());
    }

    fn on_item_complete(&self, position: usize, total: usize, identifier: &str, text_len: usize) {
        let elapsed_ms = self
            .start_times
            .lock()
            .unwrap()
            .remove(&position)
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);

        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {:<14}  {:<8}  {}",
            green("✓"),
            position,
            total,
            identifier,
            dim(&format!("{text_len:>5} chars")),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
        self.bar.inc(1);
    }

    fn on_item_error(&self, position: usize, total: usize, identifier: &str, error: &str) {
        let elapsed_ms = self
            .start_times
            .lock()
            .unwrap()
            .remove(&position)
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);

        self.errors.fetch_add(1, Ordering::SeqCst);

        // Keep the log line on one row; the full error is in the summary.
        let first_line = error.lines().next().unwrap_or(error);
        let msg = if first_line.len() > 80 {
            format!("{}\u{2026}", &first_line[..79])
        } else {
            first_line.to_string()
        };

        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {:<14}  {}  {}",
            red("✗"),
            position,
            total,
            identifier,
            red(&msg),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total_items: usize, done_count: usize) {
        let failed = total_items.saturating_sub(done_count);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} images transcribed successfully",
                green("✔"),
                bold(&done_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} images transcribed  ({} failed)",
                if done_count == 0 { red("✘") } else { cyan("⚠") },
                bold(&done_count.to_string()),
                total_items,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Transcribe a single IIIF image
  iiif2txt single --image-url "https://repository.library.brown.edu/iiif/image/bdr:318842/full/max/0/default.jpg"

  # Transcribe a whole manifest
  iiif2txt batch https://repository.library.brown.edu/iiif/presentation/bdr:425350/manifest.json

  # Batch from a directory of repository metadata exports
  iiif2txt batch ./metadata -o transcripts

  # Four items at a time against a GPU-backed Ollama
  iiif2txt batch manifest.json --concurrency 4 --base-url http://gpu-box:11434

  # Machine-readable run report
  iiif2txt batch manifest.json --json > report.json

SUPPORTED MODELS (any Ollama vision model works):
  Model            Size    Notes
  ─────────────    ─────   ─────────────────────────────────────────
  qwen2.5vl:3b     3 GB    default — strong handwriting accuracy
  llama3.2-vision  7 GB    better on degraded scans, slower
  llava            4 GB    fastest, weaker on cursive
  minicpm-v        5 GB    good multilingual coverage

ENVIRONMENT VARIABLES:
  IIIF2TXT_MODEL        Override model ID
  IIIF2TXT_BASE_URL     Override the Ollama endpoint
  IIIF2TXT_OUTPUT_DIR   Override the output directory

EXIT CODES:
  0    every item transcribed
  1    run completed but one or more items failed
  130  interrupted by the operator; partial results are preserved

SETUP:
  1. Start the backend:   ollama serve
  2. Pull a model:        ollama pull qwen2.5vl:3b
  3. Transcribe:          iiif2txt single --image-url <URL>
"#;

/// Transcribe scanned manuscripts from IIIF repositories using local vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "iiif2txt",
    version,
    about = "Transcribe IIIF manuscript images to plain text using local vision LLMs",
    long_about = "Fetch scanned manuscript pages from IIIF endpoints and transcribe them with a \
local Ollama vision model. Decoding is fully deterministic (temperature 0), so reruns over an \
unchanged collection reproduce identical text.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Ollama model ID.
    #[arg(long, global = true, env = "IIIF2TXT_MODEL", default_value = iiif2txt::config::DEFAULT_MODEL)]
    model: String,

    /// Ollama endpoint base URL.
    #[arg(long, global = true, env = "IIIF2TXT_BASE_URL", default_value = iiif2txt::config::DEFAULT_BASE_URL)]
    base_url: String,

    /// Directory where {identifier}.txt files land.
    #[arg(short, long, global = true, env = "IIIF2TXT_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// Sampling temperature (0.0 = deterministic).
    #[arg(long, global = true, env = "IIIF2TXT_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// Nucleus sampling cutoff.
    #[arg(long, global = true, env = "IIIF2TXT_TOP_P", default_value_t = 0.05)]
    top_p: f32,

    /// Max tokens generated per image.
    #[arg(long, global = true, env = "IIIF2TXT_MAX_TOKENS", default_value_t = 1048)]
    max_tokens: u32,

    /// Stop sequence (repeatable). Replaces the built-in set when given.
    #[arg(long = "stop", global = true)]
    stop: Vec<String>,

    /// Backend RNG seed. Fixed by default for reproducible reruns.
    #[arg(long, global = true, env = "IIIF2TXT_SEED")]
    seed: Option<i64>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, global = true, env = "IIIF2TXT_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Attempts per network call (fetch, manifest, model).
    #[arg(long, global = true, env = "IIIF2TXT_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    /// Base backoff delay in milliseconds.
    #[arg(long, global = true, env = "IIIF2TXT_RETRY_BASE_MS", default_value_t = 1000)]
    retry_base_ms: u64,

    /// Worklist items processed at once.
    #[arg(short, long, global = true, env = "IIIF2TXT_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Image/manifest request timeout in seconds.
    #[arg(long, global = true, env = "IIIF2TXT_FETCH_TIMEOUT", default_value_t = 30)]
    fetch_timeout: u64,

    /// Per-model-call timeout in seconds.
    #[arg(long, global = true, env = "IIIF2TXT_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Repository root for building manifest URLs from bare PIDs.
    #[arg(long, global = true, env = "IIIF2TXT_REPOSITORY_BASE",
          default_value = "https://repository.library.brown.edu")]
    repository_base: String,

    /// Metadata field carrying the PID in metadata-dir mode.
    #[arg(long, global = true, env = "IIIF2TXT_PID_FIELD", default_value = iiif2txt::config::DEFAULT_PID_FIELD)]
    pid_field: String,

    /// Output a structured JSON run report instead of human-readable text.
    #[arg(long, global = true, env = "IIIF2TXT_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, global = true, env = "IIIF2TXT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "IIIF2TXT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "IIIF2TXT_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transcribe one image URL to one text file.
    Single {
        /// URL of the image to transcribe.
        #[arg(long)]
        image_url: String,
    },
    /// Transcribe every image in a manifest or metadata collection.
    Batch {
        /// Manifest URL, manifest JSON file, or metadata directory.
        source: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar provides all the feedback that matters; suppress
    // INFO-level library logs while it is active.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli).await?;
    let backend = OllamaBackend::from_config(&config).context("Failed to build model backend")?;

    // ── Ctrl-C wiring ────────────────────────────────────────────────────
    // First signal: stop launching items, let in-flight ones finish.
    // Second signal: abort immediately.
    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!(
                    "\n{} finishing in-flight items; Ctrl-C again to abort",
                    cyan("interrupted —")
                );
                cancel.cancel();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    }

    match cli.command {
        Command::Single { ref image_url } => {
            let result = transcribe_single(image_url, &config, &backend)
                .await
                .context("Transcription failed")?;

            match result.status {
                ItemStatus::Done => {
                    if cli.json {
                        println!("{}", serde_json::to_string_pretty(&result)?);
                    } else if let Some(ref path) = result.output_path {
                        if !cli.quiet {
                            eprintln!(
                                "{}  {}  →  {}",
                                green("✔"),
                                result.identifier,
                                bold(&path.display().to_string()),
                            );
                            if result.truncated {
                                eprintln!("   {}", red("output hit the token cap; transcription is incomplete"));
                            }
                        }
                    } else {
                        // No identifier in the URL: the text goes to stdout.
                        let stdout = io::stdout();
                        let mut handle = stdout.lock();
                        handle.write_all(result.text.as_bytes())?;
                        if !result.text.ends_with('\n') {
                            handle.write_all(b"\n").ok();
                        }
                    }
                    Ok(())
                }
                ItemStatus::Failed => {
                    let detail = result
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown error".into());
                    eprintln!("{} {}", red("✘"), detail);
                    std::process::exit(1);
                }
            }
        }

        Command::Batch { ref source } => {
            let source = ManifestSource::parse(source);

            let progress: Option<ProgressCallback> = if show_progress {
                Some(CliProgressCallback::new_dynamic() as ProgressCallback)
            } else {
                None
            };

            let output = run_batch(&source, &config, &backend, &cancel, progress)
                .await
                .context("Batch run failed")?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else if !cli.quiet {
                let s = &output.summary;
                eprintln!(
                    "{}  {}/{} done  {} failed  {}ms  →  {}",
                    if s.failed == 0 { green("✔") } else { cyan("⚠") },
                    s.done,
                    s.total,
                    s.failed,
                    s.duration_ms,
                    bold(&config.output_dir.display().to_string()),
                );
                if s.truncated > 0 {
                    eprintln!(
                        "   {} transcription(s) hit the token cap",
                        dim(&s.truncated.to_string())
                    );
                }
                if !s.failed_identifiers.is_empty() {
                    eprintln!("   failed: {}", red(&s.failed_identifiers.join(", ")));
                }
            }

            std::process::exit(output.exit_code());
        }
    }
}

/// Map CLI args to `TranscribeConfig`.
async fn build_config(cli: &Cli) -> Result<TranscribeConfig> {
    let mut builder = TranscribeConfig::builder()
        .model(cli.model.clone())
        .base_url(cli.base_url.clone())
        .output_dir(cli.output_dir.clone())
        .temperature(cli.temperature)
        .top_p(cli.top_p)
        .max_tokens(cli.max_tokens)
        .max_attempts(cli.max_attempts)
        .retry_base_delay_ms(cli.retry_base_ms)
        .concurrency(cli.concurrency)
        .fetch_timeout_secs(cli.fetch_timeout)
        .api_timeout_secs(cli.api_timeout)
        .repository_base(cli.repository_base.clone())
        .metadata_pid_field(cli.pid_field.clone());

    if !cli.stop.is_empty() {
        builder = builder.stop_sequences(cli.stop.clone());
    }
    if cli.seed.is_some() {
        builder = builder.seed(cli.seed);
    }

    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {path:?}"))?;
        builder = builder.system_prompt(prompt);
    }

    builder.build().context("Invalid configuration")
}
