//! Configuration types for batch invoice extraction.
//!
//! All run behaviour is controlled through [`ExtractionConfig`], built via
//! its [`ExtractionConfigBuilder`]. Collaborators that talk to the outside
//! world (model, page source, analysis service) can be injected as trait
//! objects, which is how library users add middleware and how the tests run
//! the whole pipeline without network access or pdfium.

use crate::error::ExtractError;
use crate::normalize::TaxSlotRules;
use crate::pipeline::document_intelligence::DocumentAnalyzer;
use crate::pipeline::model::VisionModel;
use crate::pipeline::render::PageSource;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for one batch run.
///
/// # Example
/// ```rust
/// use invoice_extract::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .source_folder("./factures")
///     .dpi(200)
///     .temperature(0.0)
///     .build()
///     .unwrap();
/// assert_eq!(config.extension, "pdf");
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Directory scanned (non-recursively) for input documents.
    pub source_folder: PathBuf,

    /// File extension of input documents, without the dot. Default: `pdf`.
    pub extension: String,

    /// Report file path. Default: `results.json`.
    pub output: PathBuf,

    /// JSON Schema file for structured output. `None` uses the bundled schema.
    pub schema_path: Option<PathBuf>,

    /// Name sent with the structured-output schema. Default: `Facture`.
    pub schema_name: String,

    /// Custom system prompt. If None, uses [`crate::prompts::DEFAULT_SYSTEM_PROMPT`].
    pub system_prompt: Option<String>,

    /// Custom per-page extraction instruction. If None, uses
    /// [`crate::prompts::DEFAULT_EXTRACTION_INSTRUCTION`].
    pub instruction: Option<String>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Nucleus sampling mass. Default: 0.1.
    ///
    /// Together with the low temperature this keeps successive pages from
    /// rewording fields that were already extracted.
    pub top_p: f32,

    /// Maximum tokens the model may generate per call. Default: 4096.
    pub max_tokens: usize,

    /// Retries on transient model failures (429, 5xx, timeouts). Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// HTTP timeout per model or analysis request, in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Rendering DPI. Range: 72–600. Default: 150.
    pub dpi: u32,

    /// Optional cap on the longest rendered edge, in pixels.
    pub max_rendered_pixels: Option<u32>,

    /// How rendered pages are grouped into images. Default: one image per page.
    pub layout: PageLayout,

    /// Directory containing the pdfium shared library. Falls back to the
    /// system library when unset or when binding fails.
    pub pdfium_lib_dir: Option<String>,

    /// Which extraction path to run. Default: [`AnalysisMode::Vision`].
    pub mode: AnalysisMode,

    /// Azure OpenAI connection, used in vision mode when set.
    pub azure_openai: Option<AzureOpenAiSettings>,

    /// Document Intelligence connection, required in analysis mode.
    pub document_intelligence: Option<DocumentIntelligenceSettings>,

    /// edgequake-llm provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Model identifier for `provider_name`.
    pub model: Option<String>,

    /// Pre-constructed vision model. Takes precedence over every other source.
    pub vision_model: Option<Arc<dyn VisionModel>>,

    /// Pre-constructed page source. Default: pdfium.
    pub page_source: Option<Arc<dyn PageSource>>,

    /// Pre-constructed document analyzer. Takes precedence over `document_intelligence`.
    pub analyzer: Option<Arc<dyn DocumentAnalyzer>>,

    /// Label needles for the two tax slots of normalized records.
    pub tax_rules: TaxSlotRules,

    /// Receives per-document and per-page events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            source_folder: PathBuf::from("."),
            extension: "pdf".to_string(),
            output: PathBuf::from("results.json"),
            schema_path: None,
            schema_name: "Facture".to_string(),
            system_prompt: None,
            instruction: None,
            temperature: 0.1,
            top_p: 0.1,
            max_tokens: 4096,
            max_retries: 2,
            retry_backoff_ms: 500,
            api_timeout_secs: 120,
            dpi: 150,
            max_rendered_pixels: None,
            layout: PageLayout::default(),
            pdfium_lib_dir: None,
            mode: AnalysisMode::default(),
            azure_openai: None,
            document_intelligence: None,
            provider_name: None,
            model: None,
            vision_model: None,
            page_source: None,
            analyzer: None,
            tax_rules: TaxSlotRules::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("source_folder", &self.source_folder)
            .field("extension", &self.extension)
            .field("output", &self.output)
            .field("schema_path", &self.schema_path)
            .field("schema_name", &self.schema_name)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("layout", &self.layout)
            .field("mode", &self.mode)
            .field("azure_openai", &self.azure_openai)
            .field("document_intelligence", &self.document_intelligence)
            .field("provider_name", &self.provider_name)
            .field("model", &self.model)
            .field("vision_model", &self.vision_model.as_ref().map(|m| m.name().to_string()))
            .field("page_source", &self.page_source.as_ref().map(|_| "<dyn PageSource>"))
            .field("analyzer", &self.analyzer.as_ref().map(|_| "<dyn DocumentAnalyzer>"))
            .field("tax_rules", &self.tax_rules)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn source_folder(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.source_folder = path.into();
        self
    }

    pub fn extension(mut self, ext: impl Into<String>) -> Self {
        self.config.extension = ext.into().trim_start_matches('.').to_string();
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output = path.into();
        self
    }

    pub fn schema_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.schema_path = Some(path.into());
        self
    }

    pub fn schema_name(mut self, name: impl Into<String>) -> Self {
        self.config.schema_name = name.into();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.config.instruction = Some(instruction.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.config.top_p = p.clamp(0.0, 1.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = Some(px.max(100));
        self
    }

    pub fn layout(mut self, layout: PageLayout) -> Self {
        self.config.layout = layout;
        self
    }

    pub fn pdfium_lib_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.pdfium_lib_dir = Some(dir.into());
        self
    }

    pub fn mode(mut self, mode: AnalysisMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn azure_openai(mut self, settings: AzureOpenAiSettings) -> Self {
        self.config.azure_openai = Some(settings);
        self
    }

    pub fn document_intelligence(mut self, settings: DocumentIntelligenceSettings) -> Self {
        self.config.document_intelligence = Some(settings);
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn vision_model(mut self, model: Arc<dyn VisionModel>) -> Self {
        self.config.vision_model = Some(model);
        self
    }

    pub fn page_source(mut self, source: Arc<dyn PageSource>) -> Self {
        self.config.page_source = Some(source);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn DocumentAnalyzer>) -> Self {
        self.config.analyzer = Some(analyzer);
        self
    }

    pub fn tax_rules(mut self, rules: TaxSlotRules) -> Self {
        self.config.tax_rules = rules;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractError> {
        let c = &self.config;
        if c.extension.is_empty() {
            return Err(ExtractError::InvalidConfig(
                "File extension must not be empty".into(),
            ));
        }
        if c.schema_name.trim().is_empty() {
            return Err(ExtractError::InvalidConfig(
                "Schema name must not be empty".into(),
            ));
        }
        if let PageLayout::Stitched {
            pages_per_image,
            max_pages,
        } = c.layout
        {
            if pages_per_image == 0 {
                return Err(ExtractError::InvalidConfig(
                    "Stitched layout needs at least 1 page per image".into(),
                ));
            }
            if max_pages == Some(0) {
                return Err(ExtractError::InvalidConfig(
                    "Stitched layout page limit must be at least 1".into(),
                ));
            }
        }
        if c.tax_rules.tps_needle.is_empty() || c.tax_rules.tvq_needle.is_empty() {
            return Err(ExtractError::InvalidConfig(
                "Tax slot needles must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Which service turns a document into invoice data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AnalysisMode {
    /// Page images → vision model, last page first, with carried context. (default)
    #[default]
    Vision,
    /// Whole PDF → prebuilt-invoice analysis service → normalizer.
    DocumentIntelligence,
}

/// How rendered pages are turned into the images sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageLayout {
    /// One image per physical page. (default)
    #[default]
    PerPage,
    /// Stack consecutive pages vertically into taller images.
    Stitched {
        /// Physical pages per stitched image (≥ 1).
        pages_per_image: usize,
        /// Only the first `max_pages` pages are used, if set.
        max_pages: Option<usize>,
    },
}

/// Azure OpenAI chat-completions deployment.
#[derive(Clone, Serialize, Deserialize)]
pub struct AzureOpenAiSettings {
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`.
    pub endpoint: String,
    pub api_key: String,
    /// Deployment name. Default: `gpt-4o`.
    pub deployment: String,
    /// Default: `2024-10-21`.
    pub api_version: String,
}

impl AzureOpenAiSettings {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            deployment: "gpt-4o".to_string(),
            api_version: "2024-10-21".to_string(),
        }
    }

    pub fn with_deployment(mut self, deployment: impl Into<String>) -> Self {
        self.deployment = deployment.into();
        self
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }
}

impl fmt::Debug for AzureOpenAiSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureOpenAiSettings")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("deployment", &self.deployment)
            .field("api_version", &self.api_version)
            .finish()
    }
}

/// Azure Document Intelligence resource.
#[derive(Clone, Serialize, Deserialize)]
pub struct DocumentIntelligenceSettings {
    pub endpoint: String,
    pub api_key: String,
    /// Default: `prebuilt-invoice`.
    pub model_id: String,
    /// Default: `2024-11-30`.
    pub api_version: String,
    /// Delay between polls of a running analysis. Default: 1000 ms.
    pub poll_interval_ms: u64,
    /// Give up after this many polls. Default: 120.
    pub max_polls: u32,
}

impl DocumentIntelligenceSettings {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model_id: "prebuilt-invoice".to_string(),
            api_version: "2024-11-30".to_string(),
            poll_interval_ms: 1000,
            max_polls: 120,
        }
    }
}

impl fmt::Debug for DocumentIntelligenceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentIntelligenceSettings")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("model_id", &self.model_id)
            .field("api_version", &self.api_version)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_polls", &self.max_polls)
            .finish()
    }
}
