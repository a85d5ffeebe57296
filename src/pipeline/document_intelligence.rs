//! Document analysis path: whole PDF → prebuilt-invoice model.
//!
//! The analysis service does its own OCR and field extraction and answers
//! with the nested, type-tagged field JSON that [`crate::normalize`] flattens.
//! Analysis is a long-running operation: the submit call returns
//! `202 Accepted` with an `Operation-Location` header, which is polled until
//! the status is `succeeded` or `failed`. The two requests sit behind
//! [`OperationClient`] so the polling rules can be exercised without a
//! network.

use crate::config::DocumentIntelligenceSettings;
use crate::error::{ExtractError, ModelError};
use crate::pipeline::model::{with_retries, RetryPolicy};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::RETRY_AFTER;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const PROVIDER: &str = "document-intelligence";
const KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// What the analysis service found in one PDF.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    /// `analyzeResult.documents`: one entry per detected invoice.
    pub documents: Value,
    pub page_count: usize,
}

/// Analyzes a whole PDF in one request.
#[async_trait]
pub trait DocumentAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, pdf: &[u8]) -> Result<AnalysisOutcome, ModelError>;
}

/// The two requests of a long-running analysis.
#[async_trait]
pub trait OperationClient: Send + Sync {
    /// Start an analysis of `pdf` and return the operation URL to poll.
    async fn submit(&self, pdf: &[u8]) -> Result<String, ModelError>;

    /// Fetch the current status payload of `operation`.
    async fn status(&self, operation: &str) -> Result<Value, ModelError>;
}

/// REST transport for the Document Intelligence service.
pub struct RestOperationClient {
    client: reqwest::Client,
    settings: DocumentIntelligenceSettings,
}

impl RestOperationClient {
    pub fn new(
        settings: DocumentIntelligenceSettings,
        timeout_secs: u64,
    ) -> Result<Self, ExtractError> {
        if settings.endpoint.trim().is_empty() || settings.api_key.trim().is_empty() {
            return Err(ExtractError::ProviderNotConfigured {
                provider: PROVIDER.to_string(),
                hint: "Set DOCINTEL_URI and DOCINTEL_KEY.".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ExtractError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self { client, settings })
    }

    pub fn analyze_url(&self) -> String {
        format!(
            "{}/documentintelligence/documentModels/{}:analyze?api-version={}",
            self.settings.endpoint.trim_end_matches('/'),
            self.settings.model_id,
            self.settings.api_version
        )
    }
}

#[async_trait]
impl OperationClient for RestOperationClient {
    async fn submit(&self, pdf: &[u8]) -> Result<String, ModelError> {
        let response = self
            .client
            .post(self.analyze_url())
            .header(KEY_HEADER, &self.settings.api_key)
            .json(&json!({ "base64Source": STANDARD.encode(pdf) }))
            .send()
            .await
            .map_err(|e| ModelError::from_transport(PROVIDER, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(response).await);
        }
        response
            .headers()
            .get("operation-location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ModelError::MalformedResponse {
                provider: PROVIDER.to_string(),
                detail: format!("HTTP {status} without Operation-Location header"),
            })
    }

    async fn status(&self, operation: &str) -> Result<Value, ModelError> {
        let response = self
            .client
            .get(operation)
            .header(KEY_HEADER, &self.settings.api_key)
            .send()
            .await
            .map_err(|e| ModelError::from_transport(PROVIDER, &e))?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ModelError::MalformedResponse {
                provider: PROVIDER.to_string(),
                detail: e.to_string(),
            })
    }
}

/// Azure AI Document Intelligence analyzer.
///
/// Only the submit request is retried. Once an operation exists it is
/// polled until it settles: a transient poll failure costs one poll, and
/// running out of polls is final, so a slow document is never analysed
/// (and billed) twice.
pub struct AzureDocumentIntelligence {
    client: Arc<dyn OperationClient>,
    model_id: String,
    poll_interval: Duration,
    max_polls: u32,
    retry: RetryPolicy,
}

impl AzureDocumentIntelligence {
    pub fn new(
        settings: DocumentIntelligenceSettings,
        timeout_secs: u64,
    ) -> Result<Self, ExtractError> {
        let poll_settings = settings.clone();
        let client = RestOperationClient::new(settings, timeout_secs)?;
        Ok(Self::with_client(Arc::new(client), &poll_settings))
    }

    /// Analyzer over any transport; polling follows `settings`.
    pub fn with_client(
        client: Arc<dyn OperationClient>,
        settings: &DocumentIntelligenceSettings,
    ) -> Self {
        Self {
            client,
            model_id: settings.model_id.clone(),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            max_polls: settings.max_polls,
            retry: RetryPolicy {
                max_retries: 0,
                backoff_ms: 0,
            },
        }
    }

    /// Retry policy for the submit request.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn poll(&self, operation: &str) -> Result<AnalysisOutcome, ModelError> {
        for attempt in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;
            match self.client.status(operation).await {
                Ok(payload) => {
                    if let Some(outcome) = parse_operation(&payload)? {
                        return Ok(outcome);
                    }
                    debug!("Analysis still running (poll {})", attempt);
                }
                Err(e) if e.is_transient() => {
                    warn!("Poll {}/{} failed, polling again: {}", attempt, self.max_polls, e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(ModelError::PollingExhausted {
            provider: PROVIDER.to_string(),
            polls: self.max_polls,
        })
    }
}

#[async_trait]
impl DocumentAnalyzer for AzureDocumentIntelligence {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn analyze(&self, pdf: &[u8]) -> Result<AnalysisOutcome, ModelError> {
        let operation = with_retries(PROVIDER, self.retry, || self.client.submit(pdf)).await?;
        info!("Submitted document for {} analysis", self.model_id);
        self.poll(&operation).await
    }
}

async fn error_from_response(response: reqwest::Response) -> ModelError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok());
    let body = response.text().await.unwrap_or_default();
    ModelError::from_status(PROVIDER, status, retry_after, body)
}

/// Interpret one poll response. `Ok(None)` means the operation is still
/// running.
pub fn parse_operation(payload: &Value) -> Result<Option<AnalysisOutcome>, ModelError> {
    match payload.get("status").and_then(Value::as_str) {
        Some("succeeded") => {
            let result = payload.get("analyzeResult").ok_or_else(|| {
                ModelError::MalformedResponse {
                    provider: PROVIDER.to_string(),
                    detail: "succeeded without analyzeResult".to_string(),
                }
            })?;
            let documents = result
                .get("documents")
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new()));
            let page_count = result
                .get("pages")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            Ok(Some(AnalysisOutcome {
                documents,
                page_count,
            }))
        }
        Some("failed") => {
            let detail = payload
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("analysis failed")
                .to_string();
            Err(ModelError::Refused {
                provider: PROVIDER.to_string(),
                detail,
            })
        }
        Some("notStarted") | Some("running") => Ok(None),
        other => Err(ModelError::MalformedResponse {
            provider: PROVIDER.to_string(),
            detail: format!("unexpected operation status {other:?}"),
        }),
    }
}
