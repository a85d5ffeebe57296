//! The batch report: one JSON file per run.
//!
//! ```json
//! {
//!   "data":  [ { "file": "a.pdf", "pages": 3, "usage": { … }, "result": { … } }, … ],
//!   "stats": { "documents": 1, "pages": 3, "inputTokens": …, "outputTokens": …,
//!              "totalTokens": …, "duration": 41250 }
//! }
//! ```
//!
//! Reports are written atomically (temp file + rename) so an interrupted
//! run never leaves a truncated file behind.

use crate::error::ExtractError;
use crate::invoice::{InvoiceEnvelope, InvoiceRecord};
use crate::usage::{RunStats, UsageCounters};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::info;

/// Outcome for one source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentEntry {
    /// Source file name.
    pub file: String,
    /// Pages sent to the model or reported by the analysis service.
    pub pages: u64,
    pub usage: UsageCounters,
    /// Final model JSON (vision) or the detected documents (analysis).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Normalized records, analysis mode only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoices: Option<Vec<InvoiceRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DocumentEntry {
    pub fn success(file: impl Into<String>, usage: UsageCounters, result: Value) -> Self {
        Self {
            file: file.into(),
            pages: usage.pages,
            usage,
            result: Some(result),
            invoices: None,
            error: None,
        }
    }

    pub fn failure(file: impl Into<String>, usage: UsageCounters, error: impl ToString) -> Self {
        Self {
            file: file.into(),
            pages: usage.pages,
            usage,
            result: None,
            invoices: None,
            error: Some(error.to_string()),
        }
    }

    pub fn with_invoices(mut self, invoices: Vec<InvoiceRecord>) -> Self {
        self.invoices = Some(invoices);
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything one run produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub data: Vec<DocumentEntry>,
    pub stats: RunStats,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.data.iter().filter(|e| e.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.data.len() - self.succeeded()
    }

    pub async fn write_to(&self, path: &Path) -> Result<(), ExtractError> {
        write_json_atomic(path, self).await?;
        info!(
            "Wrote report for {} document(s) to {}",
            self.data.len(),
            path.display()
        );
        Ok(())
    }
}

/// Output of the reformat operation: `{ "data": [ { "invoice": … }, … ] }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReformattedReport {
    pub data: Vec<InvoiceEnvelope>,
}

impl From<Vec<InvoiceRecord>> for ReformattedReport {
    fn from(records: Vec<InvoiceRecord>) -> Self {
        Self {
            data: records.into_iter().map(InvoiceEnvelope::from).collect(),
        }
    }
}

/// Serialize `value` as pretty JSON and write it atomically to `path`.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ExtractError> {
    let write_failed = |source| ExtractError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| ExtractError::Internal(format!("Failed to serialise report: {e}")))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(write_failed)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);

    tokio::fs::write(&tmp_path, &json)
        .await
        .map_err(write_failed)?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(write_failed)?;
    Ok(())
}
