use clap::Parser;
use image::ImageFormat;
use std::path::{Path, PathBuf};

use crate::errors::{InpaintError, Result};
use crate::model_source::DEFAULT_MODEL;
use crate::raster::ImageSource;

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Photo to inpaint: a file or an http(s) URL.
    pub image: PathBuf,

    /// Mask image (file or URL); any non-white pixel is filled.
    pub mask: PathBuf,

    /// Output file. The format follows the extension.
    #[arg(default_value = "output.png", value_parser = check_output)]
    pub output: PathBuf,

    #[arg(short, long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Download URL for the model, overriding the built-in registry.
    #[arg(long)]
    pub model_url: Option<String>,

    /// Directory downloaded models are persisted in.
    #[arg(short, long, default_value = "models")]
    pub cache_dir: PathBuf,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    /// Also print the result as a base64 data URI.
    #[arg(long)]
    pub data_uri: bool,
}

impl Config {
    /// Checks what clap cannot: that local inputs exist.
    pub fn validate(&self) -> Result<()> {
        for (field, path) in [("image", &self.image), ("mask", &self.mask)] {
            if remote_url(path).is_none() && !path.is_file() {
                return Err(InpaintError::Configuration {
                    message: format!("{} path does not exist: {}", field, path.display()),
                });
            }
        }
        Ok(())
    }
}

impl Config {
    pub fn image_source(&self) -> ImageSource {
        input_source(&self.image)
    }

    pub fn mask_source(&self) -> ImageSource {
        input_source(&self.mask)
    }
}

fn remote_url(path: &Path) -> Option<&str> {
    path.to_str()
        .filter(|s| s.starts_with("http://") || s.starts_with("https://"))
}

fn input_source(path: &Path) -> ImageSource {
    match remote_url(path) {
        Some(url) => ImageSource::Url(url.to_string()),
        None => ImageSource::Path(path.to_path_buf()),
    }
}

fn check_output(s: &str) -> std::result::Result<PathBuf, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let path = Path::new(s);
    let format = ImageFormat::from_path(path)
        .map_err(|_| format!("{} has no supported extension. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_apply() {
        let config = Config::try_parse_from(["inpaint-rs", "photo.jpg", "mask.png"]).unwrap();
        assert_eq!(config.output, PathBuf::from("output.png"));
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.cache_dir, PathBuf::from("models"));
        assert_eq!(config.device_id, 0);
        assert!(config.model_url.is_none());
        assert!(!config.data_uri);
    }

    #[test]
    fn unknown_output_format_is_rejected() {
        assert!(check_output("result.png").is_ok());
        assert!(check_output("result.unknown").is_err());
        assert!(check_output("result").is_err());
    }

    #[test]
    fn validate_requires_existing_inputs() -> Result<()> {
        let dir = TempDir::new()?;
        let image = dir.path().join("photo.png");
        let mask = dir.path().join("mask.png");
        std::fs::write(&image, b"")?;

        let config = Config::try_parse_from([
            "inpaint-rs",
            image.to_str().unwrap(),
            mask.to_str().unwrap(),
        ])
        .unwrap();
        assert!(matches!(config.validate(), Err(InpaintError::Configuration { .. })));

        std::fs::write(&mask, b"")?;
        config.validate()
    }

    #[test]
    fn urls_skip_the_existence_check() -> Result<()> {
        let config = Config::try_parse_from([
            "inpaint-rs",
            "https://example.com/photo.jpg",
            "http://example.com/mask.png",
        ])
        .unwrap();
        config.validate()?;
        assert!(matches!(config.image_source(), ImageSource::Url(url) if url == "https://example.com/photo.jpg"));
        assert!(matches!(config.mask_source(), ImageSource::Url(_)));
        Ok(())
    }
}
