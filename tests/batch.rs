//! Batch integration tests.
//!
//! Every outside collaborator is replaced by an in-memory fake: PDFs are
//! tiny `%PDF` files whose body says how many pages they have, the page
//! source turns that into blank page images, and the model answers from a
//! script while recording what it was sent. No pdfium, no network.

use async_trait::async_trait;
use invoice_extract::pipeline::document_intelligence::{AnalysisOutcome, DocumentAnalyzer};
use invoice_extract::{
    extract_document, reformat_file, run_batch, run_batch_to_file, AnalysisMode, CallUsage,
    DocumentError, ExtractionConfig, ExtractionProgressCallback, ExtractionRequest, ModelError,
    ModelReply, Page, PageSource, ProgressCallback, VisionModel,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Reads `pages=N` from the PDF body and yields N one-byte page images.
struct FakePages;

#[async_trait]
impl PageSource for FakePages {
    async fn pages(&self, pdf: Vec<u8>) -> Result<Vec<Page>, DocumentError> {
        let text = String::from_utf8_lossy(&pdf);
        let count: usize = text
            .split("pages=")
            .nth(1)
            .and_then(|rest| rest.trim().parse().ok())
            .ok_or_else(|| DocumentError::CorruptPdf {
                detail: "no page count".into(),
            })?;
        Ok((1..=count)
            .map(|n| Page::new(n, vec![n as u8], "image/png"))
            .collect())
    }
}

/// What one call carried.
#[derive(Debug, Clone)]
struct SeenCall {
    pages: Vec<usize>,
    texts: Vec<String>,
}

/// Answers from a queue; an exhausted queue is an auth failure.
struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, ModelError>>>,
    seen: Mutex<Vec<SeenCall>>,
}

impl ScriptedModel {
    fn new(replies: Vec<Result<String, ModelError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<SeenCall> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl VisionModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ExtractionRequest<'_>) -> Result<ModelReply, ModelError> {
        self.seen.lock().unwrap().push(SeenCall {
            pages: request.images().map(|p| p.number()).collect(),
            texts: request.texts().map(str::to_string).collect(),
        });
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(ModelReply {
                text,
                usage: CallUsage::new(1000, 100),
            }),
            Some(Err(e)) => Err(e),
            None => Err(auth_error()),
        }
    }
}

struct FakeAnalyzer {
    outcome: AnalysisOutcome,
}

#[async_trait]
impl DocumentAnalyzer for FakeAnalyzer {
    fn name(&self) -> &str {
        "fake-analyzer"
    }

    async fn analyze(&self, _pdf: &[u8]) -> Result<AnalysisOutcome, ModelError> {
        Ok(self.outcome.clone())
    }
}

/// Always times out; counts how often the document was handed over.
#[derive(Default)]
struct TimingOutAnalyzer {
    calls: AtomicUsize,
}

#[async_trait]
impl DocumentAnalyzer for TimingOutAnalyzer {
    fn name(&self) -> &str {
        "timing-out"
    }

    async fn analyze(&self, _pdf: &[u8]) -> Result<AnalysisOutcome, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ModelError::Timeout {
            provider: "timing-out".into(),
        })
    }
}

#[derive(Default)]
struct RecordingProgress {
    events: Mutex<Vec<String>>,
}

impl ExtractionProgressCallback for RecordingProgress {
    fn on_batch_start(&self, total_documents: usize) {
        self.push(format!("batch:{total_documents}"));
    }
    fn on_document_start(&self, index: usize, _total: usize, name: &str) {
        self.push(format!("doc:{index}:{name}"));
    }
    fn on_page_complete(&self, page_num: usize, _total: usize, _tokens: u64) {
        self.push(format!("page:{page_num}"));
    }
    fn on_document_error(&self, name: &str, _error: &str) {
        self.push(format!("error:{name}"));
    }
    fn on_batch_complete(&self, total_documents: usize, success_count: usize) {
        self.push(format!("done:{success_count}/{total_documents}"));
    }
}

impl RecordingProgress {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Route library logs to the test output; `RUST_LOG=invoice_extract=debug`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn auth_error() -> ModelError {
    ModelError::Auth {
        provider: "scripted".into(),
        detail: "no more replies".into(),
    }
}

/// A reply satisfying every required key of the bundled schema.
fn invoice_reply(number: &str, total: f64) -> String {
    json!({
        "Fournisseur": "Quincaillerie Dupont",
        "AdresseFournisseur": null,
        "NoBonCommande": null,
        "NoFacture": number,
        "Date": "2024-03-09",
        "SousTotal": null,
        "TPS": null,
        "TVQ": null,
        "MontantTotal": total,
        "Lignes": []
    })
    .to_string()
}

fn write_pdf(dir: &Path, name: &str, pages: usize) {
    std::fs::write(dir.join(name), format!("%PDF-1.7\npages={pages}")).unwrap();
}

fn vision_config(dir: &Path, model: Arc<ScriptedModel>) -> ExtractionConfig {
    init_tracing();
    ExtractionConfig::builder()
        .source_folder(dir)
        .output(dir.join("out").join("results.json"))
        .vision_model(model as Arc<dyn VisionModel>)
        .page_source(Arc::new(FakePages))
        .max_retries(0)
        .build()
        .unwrap()
}

fn read_json(path: &Path) -> Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

// ── Vision path ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_folder_writes_empty_report() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(vec![]);
    let config = vision_config(dir.path(), Arc::clone(&model));

    let report = run_batch_to_file(&config).await.unwrap();
    assert!(report.data.is_empty());
    assert!(model.seen().is_empty());

    let written = read_json(&config.output);
    assert_eq!(written["data"], json!([]));
    assert_eq!(written["stats"]["documents"], 0);
    assert_eq!(written["stats"]["pages"], 0);
    assert_eq!(written["stats"]["totalTokens"], 0);
}

#[tokio::test]
async fn three_page_document_is_read_last_page_first() {
    let dir = tempfile::tempdir().unwrap();
    write_pdf(dir.path(), "facture.pdf", 3);
    let r3 = invoice_reply("F-1", 10.0);
    let r2 = invoice_reply("F-1", 20.0);
    let r1 = invoice_reply("F-1", 30.0);
    let model = ScriptedModel::new(vec![Ok(r3.clone()), Ok(r2.clone()), Ok(r1)]);
    let config = vision_config(dir.path(), Arc::clone(&model));

    let report = run_batch_to_file(&config).await.unwrap();

    let seen = model.seen();
    let order: Vec<Vec<usize>> = seen.iter().map(|c| c.pages.clone()).collect();
    assert_eq!(order, vec![vec![3], vec![2], vec![1]]);
    assert_eq!(seen[0].texts.len(), 1, "no context before the last page");
    assert!(seen[1].texts.last().unwrap().ends_with(&r3));
    assert!(seen[2].texts.last().unwrap().ends_with(&r2));

    assert_eq!(report.data.len(), 1);
    let entry = &report.data[0];
    assert!(entry.is_success());
    assert_eq!(entry.file, "facture.pdf");
    assert_eq!(entry.pages, 3);
    assert_eq!(entry.result.as_ref().unwrap()["MontantTotal"], json!(30.0));

    let written = read_json(&config.output);
    assert_eq!(written["data"][0]["result"]["MontantTotal"], json!(30.0));
    assert_eq!(
        written["stats"]["pages"], 3,
        "one call per page, counted once each"
    );
    assert_eq!(written["stats"]["documents"], 1);
    assert_eq!(written["stats"]["inputTokens"], 3000);
    assert_eq!(written["stats"]["outputTokens"], 300);
    assert_eq!(written["stats"]["totalTokens"], 3300);
}

#[tokio::test]
async fn failing_documents_do_not_stop_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    write_pdf(dir.path(), "a.pdf", 2);
    std::fs::write(dir.path().join("b.pdf"), b"not a pdf at all").unwrap();
    write_pdf(dir.path(), "c.pdf", 1);
    std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
    init_tracing();

    // a.pdf: page 2 succeeds, page 1 fails. c.pdf: succeeds.
    let model = ScriptedModel::new(vec![
        Ok(invoice_reply("A", 1.0)),
        Err(auth_error()),
        Ok(invoice_reply("C", 3.0)),
    ]);
    let progress = Arc::new(RecordingProgress::default());
    let config = ExtractionConfig::builder()
        .source_folder(dir.path())
        .vision_model(Arc::clone(&model) as Arc<dyn VisionModel>)
        .page_source(Arc::new(FakePages))
        .max_retries(0)
        .progress_callback(Arc::clone(&progress) as ProgressCallback)
        .build()
        .unwrap();

    let report = run_batch(&config).await.unwrap();

    let files: Vec<&str> = report.data.iter().map(|e| e.file.as_str()).collect();
    assert_eq!(files, vec!["a.pdf", "b.pdf", "c.pdf"]);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 2);

    let a = &report.data[0];
    assert!(a.error.as_deref().unwrap().contains("Page 1"));
    assert_eq!(a.usage.calls, 1, "tokens spent before the failure stay counted");

    let b = &report.data[1];
    assert!(b.error.as_deref().unwrap().contains("not a valid PDF"));
    assert_eq!(b.usage.calls, 0);

    assert_eq!(report.stats.documents, 3);
    assert_eq!(report.stats.pages, 2);

    let events = progress.events.lock().unwrap().clone();
    assert_eq!(events.first().map(String::as_str), Some("batch:3"));
    assert!(events.contains(&"error:b.pdf".to_string()));
    assert_eq!(events.last().map(String::as_str), Some("done:1/3"));
}

#[tokio::test]
async fn schema_violation_fails_only_that_document() {
    let dir = tempfile::tempdir().unwrap();
    write_pdf(dir.path(), "a.pdf", 1);
    let model = ScriptedModel::new(vec![Ok(r#"{"NoFacture": "1"}"#.to_string())]);
    let config = vision_config(dir.path(), model);

    let report = run_batch(&config).await.unwrap();
    let entry = &report.data[0];
    assert!(entry
        .error
        .as_deref()
        .unwrap()
        .contains("violates the extraction schema"));
    assert_eq!(report.stats.total_tokens, 1100);
}

#[tokio::test]
async fn extract_document_returns_one_entry() {
    let dir = tempfile::tempdir().unwrap();
    write_pdf(dir.path(), "solo.pdf", 1);
    let model = ScriptedModel::new(vec![Ok(format!(
        "```json\n{}\n```",
        invoice_reply("S-9", 5.0)
    ))]);
    let config = vision_config(dir.path(), model);

    let entry = extract_document(&dir.path().join("solo.pdf"), &config)
        .await
        .unwrap();
    assert!(entry.is_success());
    assert_eq!(entry.result.unwrap()["NoFacture"], "S-9");
    assert_eq!(entry.usage.total_tokens, 1100);
}

// ── Analysis path ────────────────────────────────────────────────────────────

fn analysis_documents() -> Value {
    json!([{
        "docType": "invoice",
        "fields": {
            "VendorName": { "valueString": "Quincaillerie Dupont" },
            "InvoiceId": { "valueString": "F-1001" },
            "InvoiceDate": { "valueDate": "2024-03-09" },
            "TaxDetails": { "valueArray": [
                { "content": "TPS 5%",
                  "valueObject": { "Amount": { "valueCurrency": { "amount": 5.0 } } } },
                { "content": "TVQ 9.975%",
                  "valueObject": { "Amount": { "valueCurrency": { "amount": 9.98 } } } }
            ] },
            "InvoiceTotal": { "valueCurrency": { "amount": 114.98 } },
            "Items": { "valueArray": [
                { "valueObject": {
                    "Description": { "valueString": "Vis 3/8" },
                    "Amount": { "valueCurrency": { "amount": 100.0 } }
                } }
            ] }
        }
    }])
}

#[tokio::test]
async fn analysis_mode_normalizes_invoices() {
    let dir = tempfile::tempdir().unwrap();
    write_pdf(dir.path(), "a.pdf", 2);
    let analyzer = FakeAnalyzer {
        outcome: AnalysisOutcome {
            documents: analysis_documents(),
            page_count: 2,
        },
    };
    let config = ExtractionConfig::builder()
        .source_folder(dir.path())
        .output(dir.path().join("results.json"))
        .mode(AnalysisMode::DocumentIntelligence)
        .analyzer(Arc::new(analyzer))
        .build()
        .unwrap();

    let report = run_batch_to_file(&config).await.unwrap();
    let entry = &report.data[0];
    assert_eq!(entry.pages, 2);
    assert_eq!(entry.usage.total_tokens, 0);
    let invoices = entry.invoices.as_ref().unwrap();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].invoice_number.as_deref(), Some("F-1001"));
    assert_eq!(invoices[0].lines.len(), 1);
    assert_eq!(report.stats.pages, 2);

    let written = read_json(&config.output);
    assert_eq!(written["data"][0]["invoices"][0]["tps"], "5.0");
    assert_eq!(written["data"][0]["invoices"][0]["tvq"], "9.98");
    assert_eq!(written["data"][0]["invoices"][0]["date"], "2024-03-09");

    // The written report can be flattened again offline.
    let out = reformat_file(&config.output, None, Default::default())
        .await
        .unwrap();
    assert_eq!(out, dir.path().join("results.json.reformat.json"));
    let flattened = read_json(&out);
    assert_eq!(flattened["data"][0]["invoice"]["invoiceNumber"], "F-1001");
    assert_eq!(flattened["data"][0]["invoice"]["total"], "114.98");
}

#[tokio::test]
async fn failed_analysis_is_not_resubmitted_by_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    write_pdf(dir.path(), "lent.pdf", 4);
    let analyzer = Arc::new(TimingOutAnalyzer::default());
    let config = ExtractionConfig::builder()
        .source_folder(dir.path())
        .mode(AnalysisMode::DocumentIntelligence)
        .analyzer(Arc::clone(&analyzer) as Arc<dyn DocumentAnalyzer>)
        .max_retries(2)
        .retry_backoff_ms(0)
        .build()
        .unwrap();

    let report = run_batch(&config).await.unwrap();

    assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    assert!(report.data[0]
        .error
        .as_deref()
        .unwrap()
        .contains("Document analysis failed"));
    assert_eq!(report.stats.documents, 1);
}

#[tokio::test]
async fn reformat_rejects_unreadable_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, b"{ not json").unwrap();
    let err = reformat_file(&path, None, Default::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("broken.json"));
}

// ── Live ─────────────────────────────────────────────────────────────────────

/// Runs the full stack against real services and real scans.
///
///   E2E_ENABLED=1 AOAI_URI=… AOAI_KEY=… INVOICE_E2E_FOLDER=./factures \
///     cargo test --test batch live -- --nocapture
#[tokio::test]
async fn live_batch_against_azure_openai() {
    if std::env::var("E2E_ENABLED").is_err() {
        println!("SKIP: set E2E_ENABLED=1 to run live tests");
        return;
    }
    let (Ok(folder), Ok(uri), Ok(key)) = (
        std::env::var("INVOICE_E2E_FOLDER"),
        std::env::var("AOAI_URI"),
        std::env::var("AOAI_KEY"),
    ) else {
        println!("SKIP: INVOICE_E2E_FOLDER, AOAI_URI and AOAI_KEY are required");
        return;
    };

    let out = tempfile::tempdir().unwrap();
    let config = ExtractionConfig::builder()
        .source_folder(folder)
        .output(out.path().join("results.json"))
        .azure_openai(invoice_extract::AzureOpenAiSettings::new(uri, key))
        .build()
        .unwrap();

    let report = run_batch_to_file(&config).await.unwrap();
    println!("{}", serde_json::to_string_pretty(&report.stats).unwrap());
    assert_eq!(report.stats.documents as usize, report.data.len());
    assert!(report.stats.total_tokens > 0 || report.data.is_empty());
}
