//! Azure OpenAI chat-completions adapter with strict structured outputs.
//!
//! Each request carries the extraction schema as
//! `response_format: { type: "json_schema", strict: true }`, so the service
//! itself guarantees a parseable reply. Page images travel as base64 `data:`
//! URIs with `detail: high`; invoices are dense and the low-detail tiling
//! loses small print.

use crate::config::AzureOpenAiSettings;
use crate::error::{ExtractError, ModelError};
use crate::pipeline::encode::to_data_uri;
use crate::pipeline::model::{ContentPart, ExtractionRequest, ModelReply, VisionModel};
use crate::usage::CallUsage;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const PROVIDER: &str = "azure-openai";

/// [`VisionModel`] backed by an Azure OpenAI deployment.
pub struct AzureOpenAiModel {
    client: reqwest::Client,
    settings: AzureOpenAiSettings,
    name: String,
}

impl AzureOpenAiModel {
    pub fn new(settings: AzureOpenAiSettings, timeout_secs: u64) -> Result<Self, ExtractError> {
        if settings.endpoint.trim().is_empty() || settings.api_key.trim().is_empty() {
            return Err(ExtractError::ProviderNotConfigured {
                provider: PROVIDER.to_string(),
                hint: "Set AOAI_URI and AOAI_KEY.".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ExtractError::Internal(format!("HTTP client: {e}")))?;
        let name = format!("{PROVIDER}/{}", settings.deployment);
        Ok(Self {
            client,
            settings,
            name,
        })
    }

    /// `{endpoint}/openai/deployments/{deployment}/chat/completions?api-version=…`
    pub fn chat_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.settings.endpoint.trim_end_matches('/'),
            self.settings.deployment,
            self.settings.api_version
        )
    }
}

#[async_trait]
impl VisionModel for AzureOpenAiModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ExtractionRequest<'_>) -> Result<ModelReply, ModelError> {
        let body = build_body(request);
        let response = self
            .client
            .post(self.chat_url())
            .header("api-key", &self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::from_transport(PROVIDER, &e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok());
            let text = response.text().await.unwrap_or_default();
            return Err(ModelError::from_status(
                PROVIDER,
                status.as_u16(),
                retry_after,
                text,
            ));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ModelError::MalformedResponse {
                provider: PROVIDER.to_string(),
                detail: e.to_string(),
            })?;
        parse_reply(&payload)
    }
}

/// Request body for one chat-completions call.
pub fn build_body(request: &ExtractionRequest<'_>) -> Value {
    let content: Vec<Value> = request
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Image(page) => json!({
                "type": "image_url",
                "image_url": { "url": to_data_uri(page), "detail": "high" }
            }),
            ContentPart::Text(text) => json!({ "type": "text", "text": text }),
        })
        .collect();

    json!({
        "messages": [
            { "role": "system", "content": request.system_prompt },
            { "role": "user", "content": content }
        ],
        "temperature": decimal3(request.decoding.temperature),
        "top_p": decimal3(request.decoding.top_p),
        "max_tokens": request.decoding.max_tokens,
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": request.schema.name(),
                "schema": request.schema.schema(),
                "strict": true
            }
        }
    })
}

/// `f32` widened without the binary noise (0.1 stays 0.1 on the wire).
fn decimal3(v: f32) -> f64 {
    (f64::from(v) * 1000.0).round() / 1000.0
}

/// Pull the reply text and token usage out of a chat-completions payload.
pub fn parse_reply(payload: &Value) -> Result<ModelReply, ModelError> {
    let malformed = |detail: &str| ModelError::MalformedResponse {
        provider: PROVIDER.to_string(),
        detail: detail.to_string(),
    };
    let refused = |detail: String| ModelError::Refused {
        provider: PROVIDER.to_string(),
        detail,
    };

    let choice = payload
        .pointer("/choices/0")
        .ok_or_else(|| malformed("no choices in response"))?;

    if choice.get("finish_reason").and_then(Value::as_str) == Some("content_filter") {
        return Err(refused("output blocked by content filter".to_string()));
    }
    if let Some(reason) = choice.pointer("/message/refusal").and_then(Value::as_str) {
        return Err(refused(reason.to_string()));
    }

    let text = choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("choice has no message content"))?;

    let tokens = |key: &str| {
        payload
            .pointer(&format!("/usage/{key}"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    let usage = CallUsage::new(tokens("prompt_tokens"), tokens("completion_tokens"));
    debug!(
        "{}: {} prompt tokens, {} completion tokens",
        PROVIDER, usage.input_tokens, usage.output_tokens
    );

    Ok(ModelReply {
        text: text.to_string(),
        usage,
    })
}
