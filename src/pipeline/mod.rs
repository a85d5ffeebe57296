//! Pipeline stages for invoice extraction.
//!
//! Each submodule implements one step; the collaborators that reach
//! outside the process (pdfium, model APIs, analysis API) sit behind traits
//! so the core stages can be exercised with in-memory fakes.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ layout ──▶ encode ──▶ sequential ──▶ (report)
//! (folder)  (pdfium)   (stitch)   (PNG)      (model, last page first)
//!
//! input ──▶ document_intelligence ──▶ normalize ──▶ (report)
//! ```
//!
//! 1. [`input`]  — list the source folder and read/validate each PDF
//! 2. [`render`] — rasterise pages; runs in `spawn_blocking` because pdfium
//!    is blocking
//! 3. [`layout`] — optionally stitch consecutive pages and cap image size
//! 4. [`encode`] — PNG-encode each image into a [`Page`]
//! 5. [`sequential`] — one model call per page, newest context carried forward
//! 6. [`model`], [`azure_openai`], [`provider`] — the model invocation seam
//! 7. [`document_intelligence`] — prebuilt-invoice analysis path
//! 8. [`postprocess`] — clean model replies before schema checks

pub mod azure_openai;
pub mod document_intelligence;
pub mod encode;
pub mod input;
pub mod layout;
pub mod model;
pub mod postprocess;
pub mod provider;
pub mod render;
pub mod sequential;

/// One encoded page image, numbered by its physical page (1-based). A
/// stitched image takes the number of the first page it shows.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    number: usize,
    data: Vec<u8>,
    media_type: String,
}

impl Page {
    pub fn new(number: usize, data: Vec<u8>, media_type: impl Into<String>) -> Self {
        Self {
            number,
            data,
            media_type: media_type.into(),
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("number", &self.number)
            .field("bytes", &self.data.len())
            .field("media_type", &self.media_type)
            .finish()
    }
}
