//! Structured-output schema loading.
//!
//! The schema is an external artifact: a JSON Schema document describing one
//! extraction response. It is loaded once per run and shared by every call.
//! A strict-mode-compatible default ships with the crate.

use crate::error::ExtractError;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Schema bundled at compile time (`schema/invoice.schema.json`).
pub const BUNDLED_SCHEMA: &str = include_str!("../schema/invoice.schema.json");

/// A loaded JSON Schema plus the name it is registered under.
#[derive(Debug, Clone)]
pub struct ExtractionSchema {
    name: String,
    schema: Value,
    compact: String,
}

impl ExtractionSchema {
    /// The bundled invoice schema.
    pub fn bundled(name: impl Into<String>) -> Result<Self, ExtractError> {
        let value: Value =
            serde_json::from_str(BUNDLED_SCHEMA).map_err(|e| ExtractError::InvalidSchema {
                path: PathBuf::from("<bundled>"),
                detail: e.to_string(),
            })?;
        Self::from_value(name, value, Path::new("<bundled>"))
    }

    /// Read and validate a schema file.
    pub async fn load(path: &Path, name: impl Into<String>) -> Result<Self, ExtractError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ExtractError::SchemaUnreadable {
                path: path.to_path_buf(),
                source: e,
            })?;
        let value: Value =
            serde_json::from_str(&text).map_err(|e| ExtractError::InvalidSchema {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        debug!("Loaded extraction schema from {}", path.display());
        Self::from_value(name, value, path)
    }

    /// Wrap an already-parsed schema. `origin` is only used in errors.
    pub fn from_value(
        name: impl Into<String>,
        schema: Value,
        origin: &Path,
    ) -> Result<Self, ExtractError> {
        let invalid = |detail: &str| ExtractError::InvalidSchema {
            path: origin.to_path_buf(),
            detail: detail.to_string(),
        };
        let obj = schema
            .as_object()
            .ok_or_else(|| invalid("top level must be a JSON object"))?;
        match obj.get("type") {
            Some(Value::String(t)) if t == "object" => {}
            Some(_) => return Err(invalid("top-level \"type\" must be \"object\"")),
            None => return Err(invalid("missing top-level \"type\"")),
        }
        let compact = schema.to_string();
        Ok(Self {
            name: name.into(),
            schema,
            compact,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Compact JSON text of the schema, for embedding in prompts.
    pub fn as_json_str(&self) -> &str {
        &self.compact
    }

    /// Top-level required property names.
    pub fn required(&self) -> Vec<&str> {
        self.schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Shallow conformance check of a reply: a JSON object carrying every
    /// top-level required property. Returns the parsed value.
    ///
    /// Strict structured-output providers already guarantee this; the check
    /// catches providers that only follow the schema through the prompt.
    pub fn check_reply(&self, text: &str) -> Result<Value, String> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| format!("not valid JSON: {e}"))?;
        let obj = value
            .as_object()
            .ok_or_else(|| "reply is not a JSON object".to_string())?;
        let missing: Vec<&str> = self
            .required()
            .into_iter()
            .filter(|k| !obj.contains_key(*k))
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing required properties: {}", missing.join(", ")));
        }
        Ok(value)
    }
}
