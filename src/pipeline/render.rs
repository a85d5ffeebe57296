//! Page source: PDF bytes → ordered page images, via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which is
//! blocking and CPU-heavy. `tokio::task::spawn_blocking` moves the work to
//! the blocking pool so the runtime's worker threads never stall on it.
//!
//! Pages are rendered at the configured DPI (full page, no cropping). An
//! optional pixel cap and the [`PageLayout`] are applied afterwards, in
//! [`crate::pipeline::layout`].

use crate::config::{ExtractionConfig, PageLayout};
use crate::error::{DocumentError, ExtractError};
use crate::pipeline::{encode, layout, Page};
use async_trait::async_trait;
use pdfium_render::prelude::*;
use tracing::{debug, info};

/// Produces the ordered page images of one document.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Render `pdf` into pages numbered 1..=n in physical order.
    async fn pages(&self, pdf: Vec<u8>) -> Result<Vec<Page>, DocumentError>;
}

/// pdfium-backed [`PageSource`].
#[derive(Debug, Clone)]
pub struct PdfiumPageSource {
    dpi: u32,
    max_rendered_pixels: Option<u32>,
    layout: PageLayout,
    lib_dir: Option<String>,
}

impl PdfiumPageSource {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            dpi: config.dpi,
            max_rendered_pixels: config.max_rendered_pixels,
            layout: config.layout,
            lib_dir: config.pdfium_lib_dir.clone(),
        }
    }

    /// Bind pdfium once up front so a missing library fails the run
    /// immediately instead of failing every document.
    pub fn check_binding(&self) -> Result<(), ExtractError> {
        bind_pdfium(self.lib_dir.as_deref())
            .map(|_| ())
            .map_err(|e| ExtractError::PdfiumBindingFailed(format!("{e:?}")))
    }
}

#[async_trait]
impl PageSource for PdfiumPageSource {
    async fn pages(&self, pdf: Vec<u8>) -> Result<Vec<Page>, DocumentError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.render_blocking(&pdf))
            .await
            .map_err(|e| DocumentError::Internal(format!("Render task panicked: {e}")))?
    }
}

impl PdfiumPageSource {
    fn render_blocking(&self, pdf: &[u8]) -> Result<Vec<Page>, DocumentError> {
        let pdfium = bind_pdfium(self.lib_dir.as_deref())
            .map_err(|e| DocumentError::Internal(format!("pdfium binding: {e:?}")))?;

        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(|e| DocumentError::CorruptPdf {
                detail: format!("{e:?}"),
            })?;

        let pages = document.pages();
        let total_pages = pages.len() as usize;
        info!("PDF loaded: {} pages", total_pages);

        let render_config = PdfRenderConfig::new().scale_page_by_factor(self.dpi as f32 / 72.0);

        let mut images = Vec::with_capacity(total_pages);
        for idx in 0..total_pages {
            let page = pages
                .get(idx as u16)
                .map_err(|e| DocumentError::RasterisationFailed {
                    page: idx + 1,
                    detail: format!("{e:?}"),
                })?;

            let bitmap = page.render_with_config(&render_config).map_err(|e| {
                DocumentError::RasterisationFailed {
                    page: idx + 1,
                    detail: format!("{e:?}"),
                }
            })?;

            let mut image = bitmap.as_image();
            if let Some(max_px) = self.max_rendered_pixels {
                image = layout::cap_size(image, max_px);
            }
            debug!(
                "Rendered page {} → {}x{} px",
                idx + 1,
                image.width(),
                image.height()
            );
            images.push(image);
        }

        layout::arrange(images, self.layout)
            .iter()
            .map(|(number, img)| {
                encode::encode_page(*number, img).map_err(|e| {
                    DocumentError::RasterisationFailed {
                        page: *number,
                        detail: format!("PNG encoding failed: {e}"),
                    }
                })
            })
            .collect()
    }
}

/// Bind to pdfium in `lib_dir` (default: the working directory), falling
/// back to the system library.
fn bind_pdfium(lib_dir: Option<&str>) -> Result<Pdfium, PdfiumError> {
    let dir = lib_dir.unwrap_or("./");
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir))
        .or_else(|_| Pdfium::bind_to_system_library())?;
    Ok(Pdfium::new(bindings))
}
