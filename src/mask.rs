//! Turns a user-drawn mask into the model's mask tensor.
//!
//! Polarity is fixed by how the network was trained: anything that is not
//! pure white marks a pixel to fill (255), pure white keeps it (0).

use image::{imageops, imageops::FilterType, DynamicImage, GrayImage};
use ndarray::Array4;

use crate::errors::{InpaintError, Result};
use crate::raster::{decode_dynamic, fetch_remote, ImageSource};

/// Tensor value for "inpaint this pixel".
pub const FILL: u8 = 255;
/// Tensor value for "keep this pixel".
pub const KEEP: u8 = 0;

const UNMARKED: u8 = 255;

/// Decodes a mask source. Failures are mask errors, not image decode errors.
pub async fn decode_mask(source: ImageSource) -> Result<DynamicImage> {
    let source = fetch_remote(source)
        .await
        .map_err(|e| InpaintError::mask("mask download", e))?;
    tokio::task::spawn_blocking(move || decode_dynamic(source))
        .await
        .map_err(|e| InpaintError::mask("mask decode task", e))?
        .map_err(|e| InpaintError::mask("mask decode", e))
}

/// Resamples, grayscales and binarizes `mask` into a `[1, 1, H, W]` tensor
/// matching the source image's exact size.
pub fn build_mask_tensor(mask: &DynamicImage, target_width: u32, target_height: u32) -> Result<Array4<u8>> {
    let gray = resize_to_gray(mask, target_width, target_height)?;
    let mut gray = binarize(gray);
    invert_polarity(&mut gray);

    let (width, height) = gray.dimensions();
    Array4::from_shape_vec((1, 1, height as usize, width as usize), gray.into_raw())
        .map_err(|e| InpaintError::mask("mask tensor construction", e))
}

/// Bilinear (triangle) resample to the target size, then luma.
pub fn resize_to_gray(mask: &DynamicImage, target_width: u32, target_height: u32) -> Result<GrayImage> {
    if target_width == 0 || target_height == 0 {
        return Err(InpaintError::mask(
            "mask resampling",
            format!("invalid target size {}x{}", target_width, target_height),
        ));
    }
    if mask.width() == 0 || mask.height() == 0 {
        return Err(InpaintError::mask("mask resampling", "mask has zero width or height"));
    }

    let rgb = mask.to_rgb8();
    let rgb = if rgb.dimensions() == (target_width, target_height) {
        rgb
    } else {
        imageops::resize(&rgb, target_width, target_height, FilterType::Triangle)
    };
    Ok(imageops::grayscale(&rgb))
}

/// Snaps every pixel to pure white or black; only exact white stays white.
///
/// Idempotent on its own output.
pub fn binarize(mut gray: GrayImage) -> GrayImage {
    for pixel in gray.pixels_mut() {
        pixel.0[0] = if pixel.0[0] == UNMARKED { UNMARKED } else { 0 };
    }
    gray
}

/// Binarized white/black -> model encoding [`KEEP`]/[`FILL`].
fn invert_polarity(gray: &mut GrayImage) {
    for pixel in gray.pixels_mut() {
        pixel.0[0] = if pixel.0[0] == UNMARKED { KEEP } else { FILL };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage, Rgba, RgbaImage};

    #[test]
    fn white_is_kept_and_anything_else_is_filled() -> Result<()> {
        // Regression guard for mask polarity: painted strokes must become 255.
        let mask = RgbImage::from_fn(4, 1, |x, _| match x {
            0 => Rgb([255, 255, 255]),
            1 => Rgb([0, 0, 0]),
            2 => Rgb([254, 254, 254]),
            _ => Rgb([255, 0, 0]),
        });
        let tensor = build_mask_tensor(&DynamicImage::ImageRgb8(mask), 4, 1)?;
        assert_eq!(tensor.as_slice().unwrap(), &[KEEP, FILL, FILL, FILL]);
        Ok(())
    }

    #[test]
    fn binarize_is_idempotent_and_two_valued() {
        let gray = GrayImage::from_fn(16, 16, |x, y| Luma([((x * 16 + y) % 256) as u8]));
        let once = binarize(gray);
        let twice = binarize(once.clone());

        assert_eq!(once, twice);
        assert!(once.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
    }

    #[test]
    fn smaller_mask_is_resampled_to_image_size() -> Result<()> {
        let mask = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([0, 0, 0])));
        let tensor = build_mask_tensor(&mask, 16, 16)?;

        assert_eq!(tensor.shape(), &[1, 1, 16, 16]);
        assert!(tensor.iter().all(|&v| v == FILL));
        Ok(())
    }

    #[test]
    fn untouched_mask_keeps_everything() -> Result<()> {
        let mask = DynamicImage::ImageRgba8(RgbaImage::from_pixel(6, 3, Rgba([255, 255, 255, 255])));
        let tensor = build_mask_tensor(&mask, 12, 6)?;
        assert!(tensor.iter().all(|&v| v == KEEP));
        Ok(())
    }

    #[test]
    fn resampling_blurs_stroke_edges_into_the_fill_region() -> Result<()> {
        // One black column in white: the smooth filter greys its neighbours,
        // which then count as marked.
        let mask = GrayImage::from_fn(4, 4, |x, _| Luma([if x == 1 { 0 } else { 255 }]));
        let tensor = build_mask_tensor(&DynamicImage::ImageLuma8(mask), 8, 8)?;

        let filled = tensor.iter().filter(|&&v| v == FILL).count();
        assert!(filled >= 16, "expected at least the upscaled stroke, got {}", filled);
        assert!(tensor.iter().any(|&v| v == KEEP));
        Ok(())
    }

    #[test]
    fn zero_target_is_a_mask_error() {
        let mask = DynamicImage::new_luma8(4, 4);
        let err = build_mask_tensor(&mask, 0, 4).unwrap_err();
        assert!(matches!(err, InpaintError::MaskProcessing { .. }));
    }

    #[tokio::test]
    async fn unreachable_mask_url_is_a_mask_error() -> Result<()> {
        let url = crate::mocks::serve_once(crate::mocks::http_response("404 Not Found", 0, b"")).await?;
        let err = decode_mask(ImageSource::Url(url)).await.unwrap_err();
        assert!(matches!(err, InpaintError::MaskProcessing { .. }), "{:?}", err);
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_mask_is_a_mask_error() {
        let err = decode_mask(ImageSource::Bytes(vec![0, 1, 2])).await.unwrap_err();
        assert!(matches!(err, InpaintError::MaskProcessing { .. }));
    }
}
