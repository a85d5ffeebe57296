//! # invoice-extract
//!
//! Extract structured invoice data from scanned, multi-page PDF invoices
//! with a vision language model.
//!
//! ## Why page by page, backwards?
//!
//! A scanned invoice has no text layer, and its content is spread unevenly:
//! line items run across the first pages, while totals and taxes sit on the
//! last one. This crate rasterises every page and asks the model about one
//! page at a time, starting from the last. Each reply is fed into the next
//! call, so by the time the model sees page 1 it has already consolidated
//! everything after it, and no request ever carries more than one image.
//!
//! ## Pipeline Overview
//!
//! ```text
//! folder of PDFs
//!  │
//!  ├─ 1. Input     list *.pdf in file-name order, check %PDF magic
//!  ├─ 2. Render    rasterise pages via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 3. Layout    optional vertical stitching / size cap
//!  ├─ 4. Encode    PNG pages
//!  ├─ 5. Extract   one structured-output call per page, last page first
//!  ├─ 6. Usage     per-document and run-wide token counters
//!  └─ 7. Report    { data: [...], stats: {...} } written atomically
//! ```
//!
//! A second mode sends the whole PDF to a prebuilt-invoice analysis
//! service and flattens its nested field JSON with [`Normalizer`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use invoice_extract::{run_batch_to_file, AzureOpenAiSettings, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ExtractionConfig::builder()
//!         .source_folder("./factures")
//!         .azure_openai(AzureOpenAiSettings::new(
//!             std::env::var("AOAI_URI")?,
//!             std::env::var("AOAI_KEY")?,
//!         ))
//!         .build()?;
//!     let report = run_batch_to_file(&config).await?;
//!     eprintln!(
//!         "{} documents, {} pages, {} tokens",
//!         report.stats.documents, report.stats.pages, report.stats.total_tokens
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `invoice-extract` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! invoice-extract = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod config;
pub mod error;
pub mod invoice;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod report;
pub mod schema;
pub mod usage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{extract_document, reformat_file, run_batch, run_batch_sync, run_batch_to_file};
pub use config::{
    AnalysisMode, AzureOpenAiSettings, DocumentIntelligenceSettings, ExtractionConfig,
    ExtractionConfigBuilder, PageLayout,
};
pub use error::{DocumentError, ExtractError, ModelError};
pub use invoice::{InvoiceRecord, LineItem};
pub use normalize::{Dialect, Normalizer, TaxSlotRules};
pub use pipeline::model::{ExtractionRequest, ModelReply, VisionModel};
pub use pipeline::render::PageSource;
pub use pipeline::Page;
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use report::{BatchReport, DocumentEntry};
pub use schema::ExtractionSchema;
pub use usage::{CallUsage, RunStats, UsageAggregator, UsageCounters};
