//! Page layout: group and size rendered pages before encoding.
//!
//! The default sends one image per physical page. Stitching stacks
//! consecutive pages into one tall image, which trades fewer calls for a
//! larger image per call. Both are plain configuration of the same page
//! source; nothing downstream knows which was used.

use crate::config::PageLayout;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgba, RgbaImage};
use tracing::debug;

/// Scale `img` down so neither edge exceeds `max_px`. Smaller images pass
/// through untouched.
pub fn cap_size(img: DynamicImage, max_px: u32) -> DynamicImage {
    if img.width() <= max_px && img.height() <= max_px {
        return img;
    }
    debug!(
        "Resizing {}x{} to fit {}px",
        img.width(),
        img.height(),
        max_px
    );
    img.resize(max_px, max_px, FilterType::Lanczos3)
}

/// Apply `layout` to rendered pages given in physical order.
///
/// Each output image is paired with the 1-based physical number of the
/// first page it shows, so a stitched image of pages 3–4 is numbered 3.
pub fn arrange(images: Vec<DynamicImage>, layout: PageLayout) -> Vec<(usize, DynamicImage)> {
    match layout {
        PageLayout::PerPage => images
            .into_iter()
            .enumerate()
            .map(|(i, img)| (i + 1, img))
            .collect(),
        PageLayout::Stitched {
            pages_per_image,
            max_pages,
        } => {
            let per_image = pages_per_image.max(1);
            let limit = max_pages.unwrap_or(images.len()).min(images.len());
            images[..limit]
                .chunks(per_image)
                .enumerate()
                .map(|(i, chunk)| (i * per_image + 1, stitch_vertical(chunk)))
                .collect()
        }
    }
}

/// Stack images top to bottom on a white canvas as wide as the widest one.
pub fn stitch_vertical(images: &[DynamicImage]) -> DynamicImage {
    if let [single] = images {
        return single.clone();
    }
    let width = images.iter().map(DynamicImage::width).max().unwrap_or(0);
    let height = images.iter().map(DynamicImage::height).sum();
    let mut canvas = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));

    let mut y: i64 = 0;
    for img in images {
        imageops::overlay(&mut canvas, &img.to_rgba8(), 0, y);
        y += i64::from(img.height());
    }
    DynamicImage::ImageRgba8(canvas)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, shade: u8) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([shade, shade, shade, 255])))
    }

    #[test]
    fn per_page_is_identity() {
        let out = arrange(vec![solid(4, 4, 0), solid(4, 4, 1)], PageLayout::PerPage);
        let numbers: Vec<usize> = out.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn stitched_groups_and_limits_pages() {
        let pages = (0..5).map(|i| solid(10, 20, i)).collect();
        let out = arrange(
            pages,
            PageLayout::Stitched {
                pages_per_image: 2,
                max_pages: Some(4),
            },
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].1.height(), 40);
        assert_eq!(out[1].1.height(), 40);
    }

    #[test]
    fn stitched_images_carry_their_first_physical_page() {
        let pages = (0..5).map(|i| solid(10, 20, i)).collect();
        let out = arrange(
            pages,
            PageLayout::Stitched {
                pages_per_image: 2,
                max_pages: None,
            },
        );
        let numbers: Vec<usize> = out.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 3, 5]);
        // The trailing odd page stands alone.
        assert_eq!(out[2].1.height(), 20);
    }

    #[test]
    fn stitch_uses_widest_page_and_keeps_order() {
        let out = stitch_vertical(&[solid(10, 5, 10), solid(20, 5, 200)]);
        assert_eq!((out.width(), out.height()), (20, 10));
        let rgba = out.to_rgba8();
        assert_eq!(rgba.get_pixel(0, 0)[0], 10);
        assert_eq!(rgba.get_pixel(0, 7)[0], 200);
        // Right of the narrow first page is white padding.
        assert_eq!(rgba.get_pixel(15, 0)[0], 255);
    }

    #[test]
    fn cap_size_shrinks_only_large_images() {
        let small = cap_size(solid(50, 80, 0), 100);
        assert_eq!((small.width(), small.height()), (50, 80));
        let big = cap_size(solid(400, 200, 0), 100);
        assert!(big.width() <= 100 && big.height() <= 100);
        assert_eq!(big.width(), 100);
    }
}
