use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use num_traits::ToPrimitive;

use crate::errors::{InpaintError, Result};

/// Alpha appended to every output pixel.
pub const OPAQUE: u8 = 255;

/// Anything the pipeline can decode into a raster.
#[derive(Clone)]
pub enum ImageSource {
    Path(PathBuf),
    /// Encoded image bytes (PNG, JPEG, ...).
    Bytes(Vec<u8>),
    /// `data:image/png;base64,...` as produced by a browser canvas.
    DataUri(String),
    /// `http(s)://` location, downloaded by [`decode`] before decoding.
    Url(String),
    Decoded(DynamicImage),
}

impl ImageSource {
    fn origin(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Bytes(bytes) => format!("<{} encoded bytes>", bytes.len()),
            Self::DataUri(_) => "<data uri>".to_string(),
            Self::Url(url) => url.clone(),
            Self::Decoded(image) => format!("<decoded {}x{}>", image.width(), image.height()),
        }
    }
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.origin())
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for ImageSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<DynamicImage> for ImageSource {
    fn from(image: DynamicImage) -> Self {
        Self::Decoded(image)
    }
}

/// Decodes any local source into a `DynamicImage`, rejecting empty rasters.
///
/// Blocking; async callers go through [`decode`]. `Url` sources must be
/// resolved with [`fetch_remote`] first.
pub fn decode_dynamic(source: ImageSource) -> Result<DynamicImage> {
    let origin = source.origin();
    let image = match source {
        ImageSource::Path(path) => image::open(&path)
            .map_err(|e| InpaintError::decode(&origin, "image read", e))?,
        ImageSource::Bytes(bytes) => image::load_from_memory(&bytes)
            .map_err(|e| InpaintError::decode(&origin, "image decode", e))?,
        ImageSource::DataUri(uri) => {
            let bytes = parse_data_uri(&uri).map_err(|e| InpaintError::decode(&origin, "data uri parse", e))?;
            image::load_from_memory(&bytes)
                .map_err(|e| InpaintError::decode(&origin, "image decode", e))?
        }
        ImageSource::Url(_) => {
            return Err(InpaintError::decode(
                origin,
                "image read",
                "remote source was not fetched",
            ))
        }
        ImageSource::Decoded(image) => image,
    };

    if image.width() == 0 || image.height() == 0 {
        return Err(InpaintError::decode(
            origin,
            "dimension check",
            "image has zero width or height",
        ));
    }
    Ok(image)
}

/// Downloads `Url` sources into `Bytes`; every other source passes through.
pub async fn fetch_remote(source: ImageSource) -> Result<ImageSource> {
    let url = match source {
        ImageSource::Url(url) => url,
        local => return Ok(local),
    };
    let response = reqwest::get(&url)
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| InpaintError::decode(&url, "image download", e))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| InpaintError::decode(&url, "image download", e))?;
    Ok(ImageSource::Bytes(bytes.to_vec()))
}

/// Decodes a source to interleaved RGB. Alpha, if any, is dropped.
pub async fn decode(source: ImageSource) -> Result<RgbImage> {
    let source = fetch_remote(source).await?;
    let origin = source.origin();
    tokio::task::spawn_blocking(move || decode_dynamic(source).map(|image| image.into_rgb8()))
        .await
        .map_err(|e| InpaintError::decode(origin, "decode task", e))?
}

fn parse_data_uri(uri: &str) -> std::result::Result<Vec<u8>, String> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| "missing `data:` scheme".to_string())?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| "missing `,` separator".to_string())?;
    if !meta.split(';').any(|part| part == "base64") {
        return Err("only base64 data uris are supported".to_string());
    }
    general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| e.to_string())
}

/// Interleaved RGB `H x W x 3` -> planar NCHW `[1, 3, H, W]`, planes in R, G, B order.
pub fn interleaved_to_planar(raster: &RgbImage) -> Array4<u8> {
    raster
        .as_ndarray3()
        .insert_axis(Axis(0))
        .as_standard_layout()
        .into_owned()
}

/// Planar NCHW `[1, 3, H, W]` -> interleaved RGBA with alpha fixed at [`OPAQUE`].
///
/// Every sample goes through [`clamp_sample`], so wider sample types coming
/// out of the network are narrowed without wrapping.
pub fn planar_to_interleaved_rgba<T>(planar: ArrayView4<T>, width: u32, height: u32) -> Result<RgbaImage>
where
    T: Copy + ToPrimitive,
{
    let expected = [1, 3, height as usize, width as usize];
    if planar.shape() != expected {
        return Err(InpaintError::inference(
            "planar to interleaved conversion",
            format!("expected shape {:?}, got {:?}", expected, planar.shape()),
        ));
    }

    let planes = planar.index_axis(Axis(0), 0);
    Ok(RgbaImage::from_fn(width, height, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let sample = |c: usize| clamp_sample(planes[[c, y, x]]);
        Rgba([sample(0), sample(1), sample(2), OPAQUE])
    }))
}

/// Clamps any numeric sample into `[0, 255]`, truncating fractions.
///
/// NaN and unrepresentable values map to 0.
pub fn clamp_sample<T: ToPrimitive>(value: T) -> u8 {
    match value.to_f64() {
        Some(v) if v >= 255.0 => 255,
        Some(v) if v > 0.0 => v as u8,
        _ => 0,
    }
}

/// The inpainted result: interleaved RGBA, fully opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputImage {
    pixels: RgbaImage,
}

impl OutputImage {
    pub fn new(pixels: RgbaImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn into_pixels(self) -> RgbaImage {
        self.pixels
    }

    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.pixels
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|e| InpaintError::encode("png encoding", e))?;
        Ok(bytes)
    }

    /// Self-contained `data:image/png;base64,...` URI.
    pub fn to_data_uri(&self) -> Result<String> {
        let png = self.to_png()?;
        Ok(format!(
            "data:image/png;base64,{}",
            general_purpose::STANDARD.encode(png)
        ))
    }

    /// Saves with the format implied by the extension.
    pub fn save(&self, path: &Path) -> Result<()> {
        let format = ImageFormat::from_path(path).map_err(|e| InpaintError::encode("output format", e))?;
        let image = DynamicImage::ImageRgba8(self.pixels.clone());
        // JPEG has no alpha channel.
        let image = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.into_rgb8()),
            _ => image,
        };
        image
            .save_with_format(path, format)
            .map_err(|e| InpaintError::encode(&format!("saving {}", path.display()), e))
    }
}
