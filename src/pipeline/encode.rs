//! Image encoding: `DynamicImage` → PNG [`Page`].
//!
//! PNG is lossless, so thin table rules and small print in scanned
//! invoices survive intact. Base64 wrapping happens later, in the model
//! adapters, because each API wants a slightly different envelope.

use crate::pipeline::Page;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rendered (or stitched) image as page `number`.
pub fn encode_page(number: usize, img: &DynamicImage) -> Result<Page, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!(
        "Encoded page {} ({}x{}) → {} bytes PNG",
        number,
        img.width(),
        img.height(),
        buf.len()
    );
    Ok(Page::new(number, buf, "image/png"))
}

/// Base64 of the page bytes.
pub fn to_base64(page: &Page) -> String {
    STANDARD.encode(page.data())
}

/// `data:` URI of the page, as accepted by OpenAI-style image parts.
pub fn to_data_uri(page: &Page) -> String {
    format!("data:{};base64,{}", page.media_type(), to_base64(page))
}
