//! Sequential extractor: one model call per page, last page first.
//!
//! Totals and tax lines usually sit on the last page of an invoice while
//! line items run across the earlier ones. Walking the pages backwards and
//! feeding each reply into the next call lets the model consolidate the
//! record as it goes, with only one page image in any single request.
//!
//! ## State machine
//!
//! ```text
//! NotStarted ──▶ ProcessingPage(n) ──▶ … ──▶ ProcessingPage(1) ──▶ Done
//!                      │                           │
//!                      └──────────▶ Failed ◀───────┘
//! ```
//!
//! An [`ExtractionState`] handles exactly one document and cannot be
//! restarted. On failure the accumulated text is dropped.

use crate::config::ExtractionConfig;
use crate::error::DocumentError;
use crate::pipeline::model::{
    complete_with_retries, ContentPart, DecodingOptions, ExtractionRequest, ModelReply,
    RetryPolicy, VisionModel,
};
use crate::pipeline::postprocess::clean_json_reply;
use crate::pipeline::Page;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::prompts::{carry_forward_context, DEFAULT_EXTRACTION_INSTRUCTION, DEFAULT_SYSTEM_PROMPT};
use crate::schema::ExtractionSchema;
use crate::usage::UsageAggregator;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where an [`ExtractionState`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionPhase {
    NotStarted,
    /// Waiting on the call for this physical page number.
    ProcessingPage(usize),
    Done,
    Failed,
}

/// Per-document extraction context.
#[derive(Debug)]
pub struct ExtractionState {
    remaining_pages: Vec<Page>,
    accumulated: Option<String>,
    call_count: usize,
    phase: ExtractionPhase,
}

impl ExtractionState {
    /// `pages` in physical order; they are consumed from the end.
    pub fn new(pages: Vec<Page>) -> Self {
        Self {
            remaining_pages: pages,
            accumulated: None,
            call_count: 0,
            phase: ExtractionPhase::NotStarted,
        }
    }

    pub fn phase(&self) -> ExtractionPhase {
        self.phase
    }

    /// Raw text of the most recent reply.
    pub fn accumulated(&self) -> Option<&str> {
        self.accumulated.as_deref()
    }

    pub fn call_count(&self) -> usize {
        self.call_count
    }

    pub fn remaining(&self) -> usize {
        self.remaining_pages.len()
    }

    fn fail(&mut self) {
        self.phase = ExtractionPhase::Failed;
        self.accumulated = None;
        self.remaining_pages.clear();
    }
}

/// Drives the per-page calls for one document at a time.
pub struct SequentialExtractor {
    model: Arc<dyn VisionModel>,
    schema: Arc<ExtractionSchema>,
    system_prompt: String,
    instruction: String,
    decoding: DecodingOptions,
    retry: RetryPolicy,
    progress: ProgressCallback,
}

impl SequentialExtractor {
    /// Extractor with the default prompts and decoding settings.
    pub fn new(model: Arc<dyn VisionModel>, schema: Arc<ExtractionSchema>) -> Self {
        Self::from_config(model, schema, &ExtractionConfig::default())
    }

    pub fn from_config(
        model: Arc<dyn VisionModel>,
        schema: Arc<ExtractionSchema>,
        config: &ExtractionConfig,
    ) -> Self {
        Self {
            model,
            schema,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            instruction: config
                .instruction
                .clone()
                .unwrap_or_else(|| DEFAULT_EXTRACTION_INSTRUCTION.to_string()),
            decoding: DecodingOptions {
                temperature: config.temperature,
                top_p: config.top_p,
                max_tokens: config.max_tokens,
            },
            retry: RetryPolicy {
                max_retries: config.max_retries,
                backoff_ms: config.retry_backoff_ms,
            },
            progress: config
                .progress_callback
                .clone()
                .unwrap_or_else(|| Arc::new(NoopProgressCallback) as ProgressCallback),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Extract one document and return the raw text of the final call
    /// (physical page 1).
    pub async fn extract(
        &self,
        pages: Vec<Page>,
        usage: &mut UsageAggregator,
    ) -> Result<String, DocumentError> {
        let mut state = ExtractionState::new(pages);
        self.run(&mut state, usage).await
    }

    /// Drive `state` to `Done` or `Failed`.
    pub async fn run(
        &self,
        state: &mut ExtractionState,
        usage: &mut UsageAggregator,
    ) -> Result<String, DocumentError> {
        if state.phase != ExtractionPhase::NotStarted {
            return Err(DocumentError::Internal(format!(
                "extraction state already used ({:?})",
                state.phase
            )));
        }
        let total = state.remaining_pages.len();
        if total == 0 {
            state.fail();
            return Err(DocumentError::EmptyDocument);
        }

        while let Some(page) = state.remaining_pages.pop() {
            let number = page.number();
            state.phase = ExtractionPhase::ProcessingPage(number);
            self.progress.on_page_start(number, total);

            let result = self
                .call_page(&page, state.accumulated.as_deref(), usage)
                .await;
            match result {
                Ok((text, output_tokens)) => {
                    state.accumulated = Some(text);
                    state.call_count += 1;
                    self.progress.on_page_complete(number, total, output_tokens);
                }
                Err(e) => {
                    warn!("{}", e);
                    self.progress.on_page_error(number, total, &e.to_string());
                    state.fail();
                    return Err(e);
                }
            }
        }

        state.phase = ExtractionPhase::Done;
        state
            .accumulated
            .take()
            .ok_or_else(|| DocumentError::Internal("no reply after final page".into()))
    }

    /// One page call. Usage is recorded as soon as the model answers, so a
    /// reply rejected afterwards is still counted.
    async fn call_page(
        &self,
        page: &Page,
        previous: Option<&str>,
        usage: &mut UsageAggregator,
    ) -> Result<(String, u64), DocumentError> {
        let carried = previous.map(carry_forward_context);

        let mut parts = vec![
            ContentPart::Image(page),
            ContentPart::Text(&self.instruction),
        ];
        if let Some(context) = carried.as_deref() {
            parts.push(ContentPart::Text(context));
        }

        let request = ExtractionRequest {
            system_prompt: &self.system_prompt,
            parts,
            decoding: self.decoding,
            schema: self.schema.as_ref(),
        };

        let ModelReply { text, usage: call } =
            complete_with_retries(self.model.as_ref(), &request, self.retry)
                .await
                .map_err(|e| DocumentError::ModelFailed {
                    page: page.number(),
                    detail: e.to_string(),
                })?;
        usage.record_call(call);
        debug!(
            "Page {} via {}: {} input tokens, {} output tokens",
            page.number(),
            self.model.name(),
            call.input_tokens,
            call.output_tokens
        );

        // Only the check sees the cleaned copy; the raw text is carried on.
        self.schema
            .check_reply(&clean_json_reply(&text))
            .map_err(|detail| DocumentError::SchemaViolation {
                page: page.number(),
                detail,
            })?;
        Ok((text, call.output_tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::usage::CallUsage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;

    /// What one request looked like.
    #[derive(Debug, Clone)]
    struct Seen {
        image_page: usize,
        texts: Vec<String>,
        temperature: f32,
        top_p: f32,
    }

    struct Scripted {
        replies: Mutex<VecDeque<Result<String, ModelError>>>,
        seen: Mutex<Vec<Seen>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VisionModel for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, req: &ExtractionRequest<'_>) -> Result<ModelReply, ModelError> {
            self.seen.lock().unwrap().push(Seen {
                image_page: req.images().next().map(Page::number).unwrap_or(0),
                texts: req.texts().map(str::to_string).collect(),
                temperature: req.decoding.temperature,
                top_p: req.decoding.top_p,
            });
            let next = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("{}".into()));
            next.map(|text| ModelReply {
                text,
                usage: CallUsage::new(100, 10),
            })
        }
    }

    fn pages(n: usize) -> Vec<Page> {
        (1..=n).map(|i| Page::new(i, vec![i as u8], "image/png")).collect()
    }

    fn loose_schema() -> Arc<ExtractionSchema> {
        Arc::new(
            ExtractionSchema::from_value("t", json!({"type": "object"}), Path::new("t")).unwrap(),
        )
    }

    fn extractor(model: Arc<Scripted>) -> SequentialExtractor {
        SequentialExtractor::new(model, loose_schema())
    }

    #[tokio::test]
    async fn three_pages_last_to_first_with_carry_forward() {
        let p3 = r#"{"total": 100}"#;
        let p2 = r#"{"total": 100, "lines": [{"amount": 40}]}"#;
        let p1 = r#"{"invoice": "F-1", "total": 100, "lines": [{"amount": 40}]}"#;
        let model = Scripted::new(vec![Ok(p3.into()), Ok(p2.into()), Ok(p1.into())]);
        let mut usage = UsageAggregator::new();

        let out = extractor(model.clone())
            .extract(pages(3), &mut usage)
            .await
            .unwrap();

        assert_eq!(out, p1);
        let seen = model.seen();
        assert_eq!(
            seen.iter().map(|s| s.image_page).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );

        // First call: instruction only.
        assert_eq!(seen[0].texts, vec![DEFAULT_EXTRACTION_INSTRUCTION.to_string()]);
        // Later calls: instruction plus the previous reply, verbatim.
        assert_eq!(seen[1].texts[1], carry_forward_context(p3));
        assert_eq!(seen[2].texts[1], carry_forward_context(p2));

        let doc = usage.document_totals();
        assert_eq!(doc.calls, 3);
        assert_eq!(doc.pages, 3);
        assert_eq!(doc.total_tokens, 330);
    }

    #[tokio::test]
    async fn single_page_has_no_carry_forward() {
        let model = Scripted::new(vec![Ok(r#"{"a":1}"#.into())]);
        let mut usage = UsageAggregator::new();
        extractor(model.clone())
            .extract(pages(1), &mut usage)
            .await
            .unwrap();
        let seen = model.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].texts.len(), 1);
        assert_eq!(seen[0].temperature, 0.1);
        assert_eq!(seen[0].top_p, 0.1);
    }

    #[tokio::test]
    async fn empty_document_is_an_error() {
        let model = Scripted::new(vec![]);
        let mut usage = UsageAggregator::new();
        let mut state = ExtractionState::new(Vec::new());
        let err = extractor(model.clone())
            .run(&mut state, &mut usage)
            .await
            .unwrap_err();
        assert!(matches!(err, DocumentError::EmptyDocument));
        assert_eq!(state.phase(), ExtractionPhase::Failed);
        assert!(model.seen().is_empty());
    }

    #[tokio::test]
    async fn model_failure_names_page_and_discards_state() {
        let model = Scripted::new(vec![
            Ok(r#"{"total": 1}"#.into()),
            Err(ModelError::Auth {
                provider: "scripted".into(),
                detail: "quota".into(),
            }),
        ]);
        let mut usage = UsageAggregator::new();
        let mut state = ExtractionState::new(pages(3));
        let err = extractor(model.clone())
            .run(&mut state, &mut usage)
            .await
            .unwrap_err();

        match err {
            DocumentError::ModelFailed { page, detail } => {
                assert_eq!(page, 2);
                assert!(detail.contains("quota"));
            }
            other => panic!("expected ModelFailed, got {other:?}"),
        }
        assert_eq!(state.phase(), ExtractionPhase::Failed);
        assert_eq!(state.accumulated(), None);
        assert_eq!(state.remaining(), 0);
        assert_eq!(state.call_count(), 1);
        // Page 1 was never sent.
        assert_eq!(model.seen().len(), 2);
        assert_eq!(usage.document_totals().calls, 1);
    }

    #[tokio::test]
    async fn non_object_reply_is_schema_violation_but_still_counted() {
        let model = Scripted::new(vec![Ok("I cannot read this invoice.".into())]);
        let mut usage = UsageAggregator::new();
        let err = extractor(model)
            .extract(pages(2), &mut usage)
            .await
            .unwrap_err();
        assert!(matches!(err, DocumentError::SchemaViolation { page: 2, .. }));
        assert_eq!(usage.document_totals().calls, 1);
    }

    #[tokio::test]
    async fn fenced_reply_is_accepted_and_carried_verbatim() {
        let fenced_p2 = "```json\n{\"total\": 5}\n```";
        let fenced_p1 = "```json\n{\"total\": 5, \"invoice\": \"F-1\"}\n```";
        let model = Scripted::new(vec![Ok(fenced_p2.into()), Ok(fenced_p1.into())]);
        let mut usage = UsageAggregator::new();
        let out = extractor(model.clone())
            .extract(pages(2), &mut usage)
            .await
            .unwrap();
        assert_eq!(model.seen()[1].texts[1], carry_forward_context(fenced_p2));
        assert_eq!(out, fenced_p1);
    }

    #[tokio::test]
    async fn state_is_not_reentrant() {
        let model = Scripted::new(vec![]);
        let ex = extractor(model);
        let mut usage = UsageAggregator::new();
        let mut state = ExtractionState::new(pages(1));
        ex.run(&mut state, &mut usage).await.unwrap();
        assert_eq!(state.phase(), ExtractionPhase::Done);
        assert!(ex.run(&mut state, &mut usage).await.is_err());
    }

    #[tokio::test]
    async fn required_keys_are_enforced() {
        let schema = Arc::new(
            ExtractionSchema::from_value(
                "t",
                json!({"type": "object", "required": ["MontantTotal"]}),
                Path::new("t"),
            )
            .unwrap(),
        );
        let model = Scripted::new(vec![Ok(r#"{"Fournisseur": "X"}"#.into())]);
        let mut usage = UsageAggregator::new();
        let err = SequentialExtractor::new(model, schema)
            .extract(pages(1), &mut usage)
            .await
            .unwrap_err();
        match err {
            DocumentError::SchemaViolation { detail, .. } => assert!(detail.contains("MontantTotal")),
            other => panic!("expected SchemaViolation, got {other:?}"),
        }
    }
}
