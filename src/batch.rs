//! Batch driver: scan a folder, extract every document, write one report.
//!
//! Documents are processed strictly one at a time in file-name order. A
//! failure inside one document (unreadable file, model error on page k, …)
//! is recorded in that document's report entry and the batch moves on;
//! only problems that make the whole run impossible surface as
//! [`ExtractError`].

use crate::config::{AnalysisMode, ExtractionConfig};
use crate::error::{DocumentError, ExtractError};
use crate::invoice::InvoiceRecord;
use crate::normalize::{Dialect, Normalizer, TaxSlotRules};
use crate::pipeline::azure_openai::AzureOpenAiModel;
use crate::pipeline::document_intelligence::{AzureDocumentIntelligence, DocumentAnalyzer};
use crate::pipeline::input;
use crate::pipeline::model::{RetryPolicy, VisionModel};
use crate::pipeline::postprocess::clean_json_reply;
use crate::pipeline::provider::ProviderModel;
use crate::pipeline::render::{PageSource, PdfiumPageSource};
use crate::pipeline::sequential::SequentialExtractor;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::report::{write_json_atomic, BatchReport, DocumentEntry, ReformattedReport};
use crate::schema::ExtractionSchema;
use crate::usage::UsageAggregator;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Extract every matching document in `config.source_folder`.
///
/// # Returns
/// `Ok(BatchReport)` whenever the run itself could proceed, even if some
/// (or all) documents failed; check [`BatchReport::failed`].
///
/// # Errors
/// Returns `Err(ExtractError)` only for fatal errors:
/// - Source folder missing or unreadable
/// - Schema file unreadable or invalid
/// - No model / analysis service configured, or pdfium cannot be bound
///
/// An empty folder is not an error: the report has no entries and zero
/// stats, and no model or pdfium is needed for it.
pub async fn run_batch(config: &ExtractionConfig) -> Result<BatchReport, ExtractError> {
    let documents = input::discover_documents(&config.source_folder, &config.extension)?;
    let progress = progress_of(config);
    let total = documents.len();
    progress.on_batch_start(total);

    let mut usage = UsageAggregator::new();
    if documents.is_empty() {
        warn!(
            "No *.{} documents in {}",
            config.extension,
            config.source_folder.display()
        );
        progress.on_batch_complete(0, 0);
        return Ok(BatchReport {
            data: Vec::new(),
            stats: usage.finish(),
        });
    }

    let engine = Engine::from_config(config).await?;
    info!("Starting batch: {} document(s), {}", total, engine.describe());

    let mut data = Vec::with_capacity(total);
    for (idx, path) in documents.iter().enumerate() {
        let name = input::display_name(path);
        progress.on_document_start(idx + 1, total, &name);
        info!("Processing {} ({}/{})", name, idx + 1, total);

        let outcome = engine.process(path, &mut usage).await;
        let doc_usage = usage.flush_document(&name);

        let entry = match outcome {
            Ok(processed) => {
                progress.on_document_complete(&name, doc_usage.pages as usize, doc_usage.total_tokens);
                let entry = DocumentEntry::success(&name, doc_usage, processed.result);
                match processed.invoices {
                    Some(invoices) => entry.with_invoices(invoices),
                    None => entry,
                }
            }
            Err(e) => {
                warn!("Skipping {}: {}", name, e);
                progress.on_document_error(&name, &e.to_string());
                DocumentEntry::failure(&name, doc_usage, &e)
            }
        };
        data.push(entry);
    }

    let report = BatchReport {
        data,
        stats: usage.finish(),
    };
    progress.on_batch_complete(total, report.succeeded());
    Ok(report)
}

/// [`run_batch`], then write the report to `config.output`.
pub async fn run_batch_to_file(config: &ExtractionConfig) -> Result<BatchReport, ExtractError> {
    let report = run_batch(config).await?;
    report.write_to(&config.output).await?;
    Ok(report)
}

/// Synchronous wrapper around [`run_batch_to_file`].
///
/// Creates a temporary tokio runtime internally.
pub fn run_batch_sync(config: &ExtractionConfig) -> Result<BatchReport, ExtractError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ExtractError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(run_batch_to_file(config))
}

/// Extract a single document outside of a batch.
///
/// Fatal configuration problems are `Err`; document-level failures come
/// back inside the entry, exactly as they would in a batch report.
pub async fn extract_document(
    path: &Path,
    config: &ExtractionConfig,
) -> Result<DocumentEntry, ExtractError> {
    let engine = Engine::from_config(config).await?;
    let mut usage = UsageAggregator::new();
    let name = input::display_name(path);
    let outcome = engine.process(path, &mut usage).await;
    let doc_usage = usage.flush_document(&name);
    Ok(match outcome {
        Ok(processed) => {
            let entry = DocumentEntry::success(&name, doc_usage, processed.result);
            match processed.invoices {
                Some(invoices) => entry.with_invoices(invoices),
                None => entry,
            }
        }
        Err(e) => DocumentEntry::failure(&name, doc_usage, &e),
    })
}

/// Normalize an analysis result file and write `<file>.reformat.json`
/// next to it, shaped `{ "data": [ { "invoice": … }, … ] }`.
///
/// The dialect is detected from the file when not given. Returns the path
/// written.
pub async fn reformat_file(
    path: &Path,
    dialect: Option<Dialect>,
    tax_rules: TaxSlotRules,
) -> Result<PathBuf, ExtractError> {
    let unreadable = |detail: String| ExtractError::ResultFileUnreadable {
        path: path.to_path_buf(),
        detail,
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| unreadable(e.to_string()))?;
    let value: Value = serde_json::from_str(&text).map_err(|e| unreadable(e.to_string()))?;

    let dialect = dialect.unwrap_or_else(|| Dialect::detect(&value));
    let records = Normalizer::new(dialect)
        .with_tax_rules(tax_rules)
        .normalize(&value);

    let out = reformat_path(path);
    write_json_atomic(&out, &ReformattedReport::from(records)).await?;
    info!("Reformatted {} ({:?}) → {}", path.display(), dialect, out.display());
    Ok(out)
}

/// `results.json` → `results.json.reformat.json`.
pub fn reformat_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".reformat.json");
    PathBuf::from(name)
}

// ── Internal helpers ─────────────────────────────────────────────────────

fn progress_of(config: &ExtractionConfig) -> ProgressCallback {
    config
        .progress_callback
        .clone()
        .unwrap_or_else(|| Arc::new(NoopProgressCallback) as ProgressCallback)
}

/// What a successfully processed document contributes to the report.
struct Processed {
    result: Value,
    invoices: Option<Vec<InvoiceRecord>>,
}

/// The per-document strategy for this run, resolved once.
enum Engine {
    Vision {
        pages: Arc<dyn PageSource>,
        extractor: SequentialExtractor,
    },
    Analysis {
        analyzer: Arc<dyn DocumentAnalyzer>,
        tax_rules: TaxSlotRules,
    },
}

impl Engine {
    async fn from_config(config: &ExtractionConfig) -> Result<Self, ExtractError> {
        match config.mode {
            AnalysisMode::Vision => {
                let schema = match config.schema_path {
                    Some(ref path) => ExtractionSchema::load(path, config.schema_name.as_str()).await?,
                    None => ExtractionSchema::bundled(config.schema_name.as_str())?,
                };
                let model = resolve_model(config)?;
                let pages = resolve_page_source(config)?;
                let extractor =
                    SequentialExtractor::from_config(model, Arc::new(schema), config);
                Ok(Engine::Vision { pages, extractor })
            }
            AnalysisMode::DocumentIntelligence => Ok(Engine::Analysis {
                analyzer: resolve_analyzer(config)?,
                tax_rules: config.tax_rules.clone(),
            }),
        }
    }

    fn describe(&self) -> String {
        match self {
            Engine::Vision { extractor, .. } => format!("vision model {}", extractor.model_name()),
            Engine::Analysis { analyzer, .. } => format!("analysis service {}", analyzer.name()),
        }
    }

    async fn process(
        &self,
        path: &Path,
        usage: &mut UsageAggregator,
    ) -> Result<Processed, DocumentError> {
        let bytes = input::read_document(path).await?;
        match self {
            Engine::Vision { pages, extractor } => {
                let pages = pages.pages(bytes).await?;
                info!("{} page image(s) to extract", pages.len());
                let text = extractor.extract(pages, usage).await?;
                let result = serde_json::from_str(&clean_json_reply(&text))
                    .map_err(|e| DocumentError::Internal(format!("final reply: {e}")))?;
                Ok(Processed {
                    result,
                    invoices: None,
                })
            }
            Engine::Analysis {
                analyzer,
                tax_rules,
            } => {
                // Analyzers own their retries: resubmitting a document starts
                // a new analysis.
                let outcome = analyzer.analyze(&bytes).await.map_err(|e| {
                    DocumentError::AnalysisFailed {
                        detail: e.to_string(),
                    }
                })?;
                usage.record_pages(outcome.page_count as u64);
                let invoices = Normalizer::new(Dialect::detect(&outcome.documents))
                    .with_tax_rules(tax_rules.clone())
                    .normalize(&outcome.documents);
                info!(
                    "{} page(s) analysed, {} invoice(s) detected",
                    outcome.page_count,
                    invoices.len()
                );
                Ok(Processed {
                    result: outcome.documents,
                    invoices: Some(invoices),
                })
            }
        }
    }
}

/// Resolve the vision model, from most-specific to least-specific:
///
/// 1. **Pre-built model** (`config.vision_model`), used as-is.
/// 2. **Azure OpenAI** (`config.azure_openai`), strict structured outputs.
/// 3. **edgequake-llm provider**, see [`ProviderModel::from_config`].
fn resolve_model(config: &ExtractionConfig) -> Result<Arc<dyn VisionModel>, ExtractError> {
    if let Some(ref model) = config.vision_model {
        return Ok(Arc::clone(model));
    }
    if let Some(ref settings) = config.azure_openai {
        let model = AzureOpenAiModel::new(settings.clone(), config.api_timeout_secs)?;
        return Ok(Arc::new(model));
    }
    Ok(Arc::new(ProviderModel::from_config(config)?))
}

fn resolve_page_source(config: &ExtractionConfig) -> Result<Arc<dyn PageSource>, ExtractError> {
    if let Some(ref source) = config.page_source {
        return Ok(Arc::clone(source));
    }
    let source = PdfiumPageSource::from_config(config);
    source.check_binding()?;
    Ok(Arc::new(source))
}

fn resolve_analyzer(config: &ExtractionConfig) -> Result<Arc<dyn DocumentAnalyzer>, ExtractError> {
    if let Some(ref analyzer) = config.analyzer {
        return Ok(Arc::clone(analyzer));
    }
    match config.document_intelligence {
        Some(ref settings) => {
            let analyzer = AzureDocumentIntelligence::new(settings.clone(), config.api_timeout_secs)?
                .with_retry(RetryPolicy {
                    max_retries: config.max_retries,
                    backoff_ms: config.retry_backoff_ms,
                });
            Ok(Arc::new(analyzer))
        }
        None => Err(ExtractError::ProviderNotConfigured {
            provider: "document-intelligence".to_string(),
            hint: "Set DOCINTEL_URI and DOCINTEL_KEY to use the analysis mode.".to_string(),
        }),
    }
}
