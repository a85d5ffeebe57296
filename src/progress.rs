//! Progress-callback trait for batch, document and page events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as the batch walks documents and the extractor walks pages.
//!
//! Pages are reported in the order they are sent to the model, which is
//! last page first in vision mode.
//!
//! # Example
//!
//! ```rust
//! use invoice_extract::{ExtractionConfig, ExtractionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     calls: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_num: usize, total_pages: usize, output_tokens: u64) {
//!         self.calls.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {page_num}/{total_pages}: {output_tokens} tokens");
//!     }
//! }
//!
//! let cb = Arc::new(CountingCallback { calls: AtomicUsize::new(0) });
//! let config = ExtractionConfig::builder()
//!     .progress_callback(cb as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the batch driver and the sequential extractor.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. The trait is `Send + Sync` so a callback can be
/// shared with a progress-bar thread.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once after the source folder is scanned.
    fn on_batch_start(&self, total_documents: usize) {
        let _ = total_documents;
    }

    /// Called before a document is read.
    fn on_document_start(&self, index: usize, total_documents: usize, name: &str) {
        let _ = (index, total_documents, name);
    }

    /// Called just before the model request for a page is sent.
    ///
    /// * `page_num`    — 1-indexed physical page number
    /// * `total_pages` — pages in the document
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called when a page call returns.
    fn on_page_complete(&self, page_num: usize, total_pages: usize, output_tokens: u64) {
        let _ = (page_num, total_pages, output_tokens);
    }

    /// Called when a page call fails; the document is abandoned after this.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Called when a document finished successfully.
    fn on_document_complete(&self, name: &str, pages: usize, total_tokens: u64) {
        let _ = (name, pages, total_tokens);
    }

    /// Called when a document failed.
    fn on_document_error(&self, name: &str, error: &str) {
        let _ = (name, error);
    }

    /// Called once after every document has been attempted.
    fn on_batch_complete(&self, total_documents: usize, success_count: usize) {
        let _ = (total_documents, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
