//! CLI binary for invoice-extract.
//!
//! A thin shim over the library crate that maps CLI flags and environment
//! variables to `ExtractionConfig`, runs the batch and prints a summary.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use invoice_extract::{
    reformat_file, run_batch_to_file, AnalysisMode, AzureOpenAiSettings, Dialect,
    DocumentIntelligenceSettings, ExtractionConfig, ExtractionProgressCallback, PageLayout,
    ProgressCallback, TaxSlotRules,
};
use std::io;
use std::path::{Path, PathBuf};
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

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar over documents, one log line per
/// page call and per finished document.
struct CliProgressCallback {
    bar: ProgressBar,
    /// Start of the page call in flight.
    page_started: Mutex<Option<Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Scanning folder…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            page_started: Mutex::new(None),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} documents  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    fn page_elapsed(&self) -> f64 {
        self.page_started
            .lock()
            .ok()
            .and_then(|mut started| started.take())
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

fn truncate(msg: &str, max: usize) -> String {
    if msg.chars().count() > max {
        let head: String = msg.chars().take(max - 1).collect();
        format!("{head}\u{2026}")
    } else {
        msg.to_string()
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_documents: usize) {
        self.activate_bar(total_documents);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracting {total_documents} document(s)…"))
        ));
    }

    fn on_document_start(&self, index: usize, total_documents: usize, name: &str) {
        self.bar.println(format!(
            "{} {}  {}",
            cyan("▸"),
            bold(name),
            dim(&format!("({index}/{total_documents})"))
        ));
        self.bar.set_message(name.to_string());
    }

    fn on_page_start(&self, page_num: usize, _total_pages: usize) {
        if let Ok(mut started) = self.page_started.lock() {
            *started = Some(Instant::now());
        }
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_complete(&self, page_num: usize, total_pages: usize, output_tokens: u64) {
        let secs = self.page_elapsed();
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<12}  {}",
            green("✓"),
            page_num,
            total_pages,
            dim(&format!("{output_tokens:>5} tokens")),
            dim(&format!("{secs:.1}s")),
        ));
    }

    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let secs = self.page_elapsed();
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_num,
            total_pages,
            red(&truncate(error, 80)),
            dim(&format!("{secs:.1}s")),
        ));
    }

    fn on_document_complete(&self, name: &str, pages: usize, total_tokens: u64) {
        self.bar.println(format!(
            "  {} {}  {}",
            green("✔"),
            name,
            dim(&format!("{pages} page(s), {total_tokens} tokens"))
        ));
        self.bar.inc(1);
    }

    fn on_document_error(&self, name: &str, error: &str) {
        self.bar.println(format!(
            "  {} {}  {}",
            red("✘"),
            name,
            red(&truncate(error, 100))
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total_documents: usize, success_count: usize) {
        let failed = total_documents.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} document(s) extracted successfully",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} document(s) extracted  ({} failed)",
                if failed == total_documents {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&success_count.to_string()),
                total_documents,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract every PDF in ./factures with Azure OpenAI
  AOAI_URI=https://my-res.openai.azure.com AOAI_KEY=... invoice-extract ./factures

  # Write the report somewhere else
  invoice-extract ./factures -o out/factures.json

  # Use the prebuilt-invoice analysis service instead of the vision model
  DOCINTEL_URI=... DOCINTEL_KEY=... invoice-extract --mode document-intelligence ./factures

  # Flatten an existing analysis result file to results.json.reformat.json
  invoice-extract --reformat results.json

  # Any edgequake-llm provider (schema sent in the prompt)
  invoice-extract --provider anthropic --model claude-sonnet-4-20250514 ./factures

  # Stitch the first 4 pages into one image
  invoice-extract --stitch 4 --stitch-max-pages 4 ./factures

ENVIRONMENT VARIABLES:
  SOURCE_FOLDER           Folder scanned for *.pdf
  AOAI_URI / AOAI_KEY     Azure OpenAI endpoint and key
  AOAI_DEPLOYMENT         Azure OpenAI deployment (default gpt-4o)
  DOCINTEL_URI / DOCINTEL_KEY  Document Intelligence endpoint and key
  OPENAI_API_KEY          OpenAI API key (when Azure OpenAI is not set)
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Directory containing libpdfium
  RUST_LOG                Log filter, e.g. invoice_extract=debug
"#;

/// Extract structured invoice data from scanned PDFs with vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "invoice-extract",
    version,
    about = "Extract structured invoice data from scanned PDFs with vision LLMs",
    long_about = "Rasterises every page of every PDF in a folder and sends the pages to a \
vision model one at a time, last page first, carrying each reply forward as context. \
Writes one JSON report with the extracted invoices and token usage.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Folder scanned (non-recursively) for input documents.
    #[arg(env = "SOURCE_FOLDER", default_value = ".")]
    source_folder: PathBuf,

    /// Report file path.
    #[arg(short, long, env = "INVOICE_OUTPUT", default_value = "results.json")]
    output: PathBuf,

    /// Input file extension.
    #[arg(long, env = "INVOICE_EXTENSION", default_value = "pdf")]
    extension: String,

    /// Extraction path.
    #[arg(long, env = "INVOICE_MODE", value_enum, default_value = "vision")]
    mode: ModeArg,

    /// Normalize this analysis result file to <FILE>.reformat.json and exit.
    #[arg(long, value_name = "FILE")]
    reformat: Option<PathBuf>,

    /// Field spelling of the file given to --reformat (detected if omitted).
    #[arg(long, value_enum, requires = "reformat")]
    dialect: Option<DialectArg>,

    /// JSON Schema for the structured output (bundled schema if omitted).
    #[arg(long, env = "INVOICE_SCHEMA")]
    schema: Option<PathBuf>,

    /// Name the schema is registered under.
    #[arg(long, env = "INVOICE_SCHEMA_NAME", default_value = "Facture")]
    schema_name: String,

    /// Azure OpenAI endpoint.
    #[arg(long, env = "AOAI_URI")]
    aoai_uri: Option<String>,

    /// Azure OpenAI key.
    #[arg(long, env = "AOAI_KEY", hide_env_values = true)]
    aoai_key: Option<String>,

    /// Azure OpenAI deployment name.
    #[arg(long, env = "AOAI_DEPLOYMENT", default_value = "gpt-4o")]
    aoai_deployment: String,

    /// Azure OpenAI API version.
    #[arg(long, env = "AOAI_API_VERSION", default_value = "2024-10-21")]
    aoai_api_version: String,

    /// Document Intelligence endpoint.
    #[arg(long, env = "DOCINTEL_URI")]
    docintel_uri: Option<String>,

    /// Document Intelligence key.
    #[arg(long, env = "DOCINTEL_KEY", hide_env_values = true)]
    docintel_key: Option<String>,

    /// edgequake-llm provider: openai, anthropic, gemini, ollama.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Model ID for --provider.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Rendering DPI (72–600).
    #[arg(long, env = "INVOICE_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Cap on the longest rendered edge, in pixels.
    #[arg(long, env = "INVOICE_MAX_PIXELS")]
    max_pixels: Option<u32>,

    /// Stack this many consecutive pages into one image.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    stitch: Option<u32>,

    /// With --stitch, only use the first N pages.
    #[arg(long, requires = "stitch")]
    stitch_max_pages: Option<usize>,

    /// Directory containing the pdfium library.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib_path: Option<String>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "INVOICE_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Path to a text file containing a custom per-page instruction.
    #[arg(long, env = "INVOICE_INSTRUCTION")]
    instruction: Option<PathBuf>,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "INVOICE_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Nucleus sampling mass (0.0–1.0).
    #[arg(long, env = "INVOICE_TOP_P", default_value_t = 0.1)]
    top_p: f32,

    /// Max output tokens per call.
    #[arg(long, env = "INVOICE_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Retries per call on transient failures.
    #[arg(long, env = "INVOICE_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// HTTP timeout per request in seconds.
    #[arg(long, env = "INVOICE_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Label needle for the TPS tax slot.
    #[arg(long, default_value = "P")]
    tps_label: String,

    /// Label needle for the TVQ tax slot.
    #[arg(long, default_value = "V")]
    tvq_label: String,

    /// Disable progress bar.
    #[arg(long, env = "INVOICE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "INVOICE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "INVOICE_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Vision,
    DocumentIntelligence,
}

impl From<ModeArg> for AnalysisMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::Vision => AnalysisMode::Vision,
            ModeArg::DocumentIntelligence => AnalysisMode::DocumentIntelligence,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum DialectArg {
    Rest,
    Sdk,
}

impl From<DialectArg> for Dialect {
    fn from(v: DialectArg) -> Self {
        match v {
            DialectArg::Rest => Dialect::Rest,
            DialectArg::Sdk => Dialect::Sdk,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && cli.reformat.is_none();
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

    let tax_rules = TaxSlotRules {
        tps_needle: cli.tps_label.clone(),
        tvq_needle: cli.tvq_label.clone(),
    };

    // ── Reformat-only mode ───────────────────────────────────────────────
    if let Some(ref path) = cli.reformat {
        let out = reformat_file(path, cli.dialect.map(Dialect::from), tax_rules)
            .await
            .with_context(|| format!("Failed to reformat {}", path.display()))?;
        if !cli.quiet {
            eprintln!("{}  {}", green("✔"), bold(&out.display().to_string()));
        }
        return Ok(());
    }

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, tax_rules, progress_cb).await?;

    // ── Run batch ────────────────────────────────────────────────────────
    let report = run_batch_to_file(&config)
        .await
        .context("Extraction failed")?;

    if !cli.quiet {
        let stats = &report.stats;
        eprintln!(
            "{}  {}/{} documents  {} pages  {}ms  →  {}",
            if report.failed() == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            report.succeeded(),
            stats.documents,
            stats.pages,
            stats.duration,
            bold(&config.output.display().to_string()),
        );
        eprintln!(
            "   {} tokens in  /  {} tokens out  /  {} total",
            dim(&stats.input_tokens.to_string()),
            dim(&stats.output_tokens.to_string()),
            dim(&stats.total_tokens.to_string()),
        );
    }

    if !report.data.is_empty() && report.succeeded() == 0 {
        anyhow::bail!(
            "All {} document(s) failed; see {}",
            report.data.len(),
            config.output.display()
        );
    }
    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(
    cli: &Cli,
    tax_rules: TaxSlotRules,
    progress: Option<ProgressCallback>,
) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .source_folder(&cli.source_folder)
        .output(&cli.output)
        .extension(&cli.extension)
        .mode(cli.mode.into())
        .schema_name(&cli.schema_name)
        .dpi(cli.dpi)
        .temperature(cli.temperature)
        .top_p(cli.top_p)
        .max_tokens(cli.max_tokens)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .tax_rules(tax_rules);

    if let Some(ref path) = cli.schema {
        builder = builder.schema_path(path);
    }
    if let Some(ref path) = cli.system_prompt {
        builder = builder.system_prompt(read_text(path).await?);
    }
    if let Some(ref path) = cli.instruction {
        builder = builder.instruction(read_text(path).await?);
    }
    if let Some(px) = cli.max_pixels {
        builder = builder.max_rendered_pixels(px);
    }
    if let Some(pages_per_image) = cli.stitch {
        builder = builder.layout(PageLayout::Stitched {
            pages_per_image: pages_per_image as usize,
            max_pages: cli.stitch_max_pages,
        });
    }
    if let Some(ref dir) = cli.pdfium_lib_path {
        builder = builder.pdfium_lib_dir(dir);
    }
    if let (Some(uri), Some(key)) = (&cli.aoai_uri, &cli.aoai_key) {
        builder = builder.azure_openai(
            AzureOpenAiSettings::new(uri, key)
                .with_deployment(&cli.aoai_deployment)
                .with_api_version(&cli.aoai_api_version),
        );
    }
    if let (Some(uri), Some(key)) = (&cli.docintel_uri, &cli.docintel_key) {
        builder = builder.document_intelligence(DocumentIntelligenceSettings::new(uri, key));
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

async fn read_text(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))
}
