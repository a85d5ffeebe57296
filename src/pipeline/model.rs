//! The model invocation seam.
//!
//! [`VisionModel`] accepts a system instruction, a user turn made of image
//! and text parts, decoding settings, and the structured-output schema, and
//! returns the reply text plus token usage. Adapters live in
//! [`crate::pipeline::azure_openai`] and [`crate::pipeline::provider`].
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors from model APIs are transient and frequent under
//! load. [`complete_with_retries`] retries only errors flagged by
//! [`ModelError::is_transient`], waiting `retry_backoff_ms * 2^attempt`
//! unless the server named its own delay. With a 500 ms base and 2 retries
//! the wait sequence is 500 ms → 1 s.

use crate::error::ModelError;
use crate::pipeline::Page;
use crate::schema::ExtractionSchema;
use crate::usage::CallUsage;
use async_trait::async_trait;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::warn;

/// One part of the user turn.
#[derive(Debug, Clone, Copy)]
pub enum ContentPart<'a> {
    Image(&'a Page),
    Text(&'a str),
}

/// Low-randomness decoding settings sent with every call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodingOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: usize,
}

/// Everything one model call needs.
#[derive(Debug, Clone)]
pub struct ExtractionRequest<'a> {
    pub system_prompt: &'a str,
    pub parts: Vec<ContentPart<'a>>,
    pub decoding: DecodingOptions,
    pub schema: &'a ExtractionSchema,
}

impl ExtractionRequest<'_> {
    pub fn images(&self) -> impl Iterator<Item = &Page> + '_ {
        self.parts.iter().filter_map(|p| match p {
            ContentPart::Image(page) => Some(*page),
            ContentPart::Text(_) => None,
        })
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> + '_ {
        self.parts.iter().filter_map(|p| match p {
            ContentPart::Text(t) => Some(*t),
            ContentPart::Image(_) => None,
        })
    }
}

/// A successful reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReply {
    pub text: String,
    pub usage: CallUsage,
}

/// A vision-capable model with structured output.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Short identifier used in logs and error messages.
    fn name(&self) -> &str;

    async fn complete(&self, request: &ExtractionRequest<'_>) -> Result<ModelReply, ModelError>;
}

/// How often and how patiently to retry transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based) after `err`.
    pub fn delay(&self, attempt: u32, err: &ModelError) -> Duration {
        match err.retry_after_secs() {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_millis(self.backoff_ms * 2u64.pow(attempt.saturating_sub(1))),
        }
    }
}

/// Call `model`, retrying transient failures according to `policy`.
pub async fn complete_with_retries(
    model: &dyn VisionModel,
    request: &ExtractionRequest<'_>,
    policy: RetryPolicy,
) -> Result<ModelReply, ModelError> {
    with_retries(model.name(), policy, || model.complete(request)).await
}

/// Run `op` until it succeeds, fails permanently, or `policy` is exhausted.
pub async fn with_retries<T, F, Fut>(
    name: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, ModelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt, &e);
                warn!(
                    "{}: retry {}/{} after {:?}: {}",
                    name, attempt, policy.max_retries, delay, e
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        error: ModelError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl VisionModel for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn complete(&self, _: &ExtractionRequest<'_>) -> Result<ModelReply, ModelError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(ModelReply {
                    text: "{}".into(),
                    usage: CallUsage::new(1, 1),
                })
            }
        }
    }

    fn request(schema: &ExtractionSchema) -> ExtractionRequest<'_> {
        ExtractionRequest {
            system_prompt: "sys",
            parts: vec![ContentPart::Text("hello")],
            decoding: DecodingOptions {
                temperature: 0.1,
                top_p: 0.1,
                max_tokens: 100,
            },
            schema,
        }
    }

    const FAST: RetryPolicy = RetryPolicy {
        max_retries: 2,
        backoff_ms: 1,
    };

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let schema = ExtractionSchema::bundled("Facture").unwrap();
        let model = Flaky {
            failures: 2,
            error: ModelError::Http {
                provider: "p".into(),
                status: 503,
                body: String::new(),
            },
            calls: AtomicU32::new(0),
        };
        let reply = complete_with_retries(&model, &request(&schema), FAST)
            .await
            .unwrap();
        assert_eq!(reply.text, "{}");
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let schema = ExtractionSchema::bundled("Facture").unwrap();
        let model = Flaky {
            failures: 10,
            error: ModelError::Timeout {
                provider: "p".into(),
            },
            calls: AtomicU32::new(0),
        };
        let err = complete_with_retries(&model, &request(&schema), FAST)
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Timeout { .. }));
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let schema = ExtractionSchema::bundled("Facture").unwrap();
        let model = Flaky {
            failures: 1,
            error: ModelError::Auth {
                provider: "p".into(),
                detail: "bad key".into(),
            },
            calls: AtomicU32::new(0),
        };
        assert!(complete_with_retries(&model, &request(&schema), FAST)
            .await
            .is_err());
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_provider_requests_are_not_retried() {
        let schema = ExtractionSchema::bundled("Facture").unwrap();
        let model = Flaky {
            failures: 10,
            error: ModelError::from_provider_message("anthropic", "API error 400: Bad Request"),
            calls: AtomicU32::new(0),
        };
        let err = complete_with_retries(&model, &request(&schema), FAST)
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Http { status: 400, .. }));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_doubles_and_honours_retry_after() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_ms: 500,
        };
        let timeout = ModelError::Timeout {
            provider: "p".into(),
        };
        assert_eq!(policy.delay(1, &timeout), Duration::from_millis(500));
        assert_eq!(policy.delay(3, &timeout), Duration::from_millis(2000));
        let limited = ModelError::RateLimited {
            provider: "p".into(),
            retry_after_secs: Some(7),
        };
        assert_eq!(policy.delay(1, &limited), Duration::from_secs(7));
    }

    #[test]
    fn request_splits_parts() {
        let schema = ExtractionSchema::bundled("Facture").unwrap();
        let page = Page::new(1, vec![0], "image/png");
        let req = ExtractionRequest {
            parts: vec![ContentPart::Image(&page), ContentPart::Text("a")],
            ..request(&schema)
        };
        assert_eq!(req.images().count(), 1);
        assert_eq!(req.texts().collect::<Vec<_>>(), vec!["a"]);
    }
}
