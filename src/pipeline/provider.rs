//! edgequake-llm adapter: any [`LLMProvider`] as a [`VisionModel`].
//!
//! Providers reached through edgequake-llm (OpenAI, Anthropic, Gemini,
//! Ollama, …) do not share a structured-output API, so the schema travels
//! in the system prompt instead and replies are checked after the fact by
//! the sequential extractor.

use crate::config::ExtractionConfig;
use crate::error::{ExtractError, ModelError};
use crate::pipeline::encode::to_base64;
use crate::pipeline::model::{ExtractionRequest, ModelReply, VisionModel};
use crate::prompts::schema_instruction;
use crate::usage::CallUsage;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_MODEL: &str = "gpt-4o";

/// [`VisionModel`] over an edgequake-llm provider.
pub struct ProviderModel {
    provider: Arc<dyn LLMProvider>,
    name: String,
}

impl ProviderModel {
    pub fn new(provider: Arc<dyn LLMProvider>, name: impl Into<String>) -> Self {
        Self {
            provider,
            name: name.into(),
        }
    }

    /// Resolve a provider from configuration and environment.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, ExtractError> {
        let (provider, name) = resolve_provider(config)?;
        info!("Using LLM provider {}", name);
        Ok(Self::new(provider, name))
    }
}

#[async_trait]
impl VisionModel for ProviderModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ExtractionRequest<'_>) -> Result<ModelReply, ModelError> {
        let system = format!(
            "{}{}",
            request.system_prompt,
            schema_instruction(request.schema.name(), request.schema.as_json_str())
        );
        let images: Vec<ImageData> = request
            .images()
            .map(|page| ImageData::new(to_base64(page), page.media_type()).with_detail("high"))
            .collect();
        let text = request.texts().collect::<Vec<_>>().join("\n\n");

        let messages = vec![
            ChatMessage::system(&system),
            ChatMessage::user_with_images(&text, images),
        ];
        // top_p is not forwarded: the provider layer exposes temperature
        // and output length only.
        let options = CompletionOptions {
            temperature: Some(request.decoding.temperature),
            max_tokens: Some(request.decoding.max_tokens),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| ModelError::from_provider_message(&self.name, &e.to_string()))?;

        debug!(
            "{}: {} prompt tokens, {} completion tokens",
            self.name, response.prompt_tokens, response.completion_tokens
        );
        Ok(ModelReply {
            text: response.content,
            usage: CallUsage::new(
                response.prompt_tokens as u64,
                response.completion_tokens as u64,
            ),
        })
    }
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ExtractError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Named provider + model** (`config.provider_name`, `config.model`).
/// 2. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`),
///    honoured only when both are set.
/// 3. **OpenAI key** (`OPENAI_API_KEY`), preferred over other keys.
/// 4. **Full auto-detection** (`ProviderFactory::from_env`).
fn resolve_provider(
    config: &ExtractionConfig,
) -> Result<(Arc<dyn LLMProvider>, String), ExtractError> {
    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return Ok((create_vision_provider(name, model)?, format!("{name}/{model}")));
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return Ok((
                create_vision_provider(&prov, &model)?,
                format!("{prov}/{model}"),
            ));
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return Ok((
                create_vision_provider("openai", model)?,
                format!("openai/{model}"),
            ));
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ExtractError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No vision model is configured.\n\
                Set AOAI_URI and AOAI_KEY for Azure OpenAI, or OPENAI_API_KEY / \
                ANTHROPIC_API_KEY for another provider.\n\
                Error: {}",
                e
            ),
        })?;
    Ok((llm_provider, "auto".to_string()))
}
