use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::errors::{InpaintError, Result};
use crate::model_cache::ProgressReporter;
use crate::traits::{ModelSource, ModelStore};

/// Name of the inpainting model the pipeline asks for by default.
pub const DEFAULT_MODEL: &str = "inpaint";

/// MI-GAN inpainting pipeline exported to ONNX with uint8 inputs and outputs.
pub const DEFAULT_MODEL_URL: &str =
    "https://huggingface.co/lxfater/inpaint-web/resolve/main/migan.onnx";

/// Upper bound on the buffer reserved up front from `Content-Length`.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// Maps model names to download URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRegistry {
    urls: HashMap<String, String>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::empty().with_model(DEFAULT_MODEL, DEFAULT_MODEL_URL)
    }
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self {
            urls: HashMap::new(),
        }
    }

    pub fn with_model(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.urls.insert(name.into(), url.into());
        self
    }

    pub fn url(&self, name: &str) -> Option<&str> {
        self.urls.get(name).map(String::as_str)
    }
}

/// Streams models over HTTP(S).
///
/// No request timeout is configured: a stalled server stalls the caller.
pub struct HttpModelSource {
    client: reqwest::Client,
    registry: ModelRegistry,
}

impl HttpModelSource {
    pub fn new(registry: ModelRegistry) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| InpaintError::Configuration {
                message: format!("HTTP client initialization failed: {}", e),
            })?;
        Ok(Self { client, registry })
    }
}

#[async_trait]
impl ModelSource for HttpModelSource {
    async fn fetch(&self, name: &str, progress: &ProgressReporter) -> Result<Vec<u8>> {
        let url = self.registry.url(name).ok_or_else(|| {
            InpaintError::model_unavailable(name, "model lookup", "no download URL registered")
        })?;
        debug!("fetching `{}` from {}", name, url);

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| InpaintError::model_unavailable(name, "model request", e))?;

        let total = response.content_length();
        // The header is only a hint; the body may be shorter or a lie.
        let reserve = total.map_or(0, |t| t.min(MAX_PREALLOC));
        let mut bytes = Vec::with_capacity(usize::try_from(reserve).unwrap_or(0));
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| InpaintError::model_unavailable(name, "model download", e))?
        {
            bytes.extend_from_slice(&chunk);
            progress.advance(bytes.len() as u64, total);
        }

        if let Some(expected) = total {
            if bytes.len() as u64 != expected {
                return Err(InpaintError::model_unavailable(
                    name,
                    "model download",
                    format!("truncated body: {} of {} bytes", bytes.len(), expected),
                ));
            }
        }
        Ok(bytes)
    }
}

/// Stores each model as `<dir>/<name>.onnx`.
#[derive(Debug, Clone)]
pub struct FsModelStore {
    dir: PathBuf,
}

impl FsModelStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.onnx", storage_key(name)))
    }
}

#[async_trait]
impl ModelStore for FsModelStore {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(InpaintError::model_unavailable(name, "reading stored model", e)),
        }
    }

    async fn save(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.dir.clone();
        let path = self.path_for(name);
        let bytes = bytes.to_vec();

        // Each writer gets its own temp file; readers only ever see a
        // complete file and the last rename wins.
        let stored = path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            let mut partial = tempfile::Builder::new()
                .prefix(".")
                .suffix(".onnx.part")
                .tempfile_in(&dir)?;
            partial.write_all(&bytes)?;
            partial.as_file().sync_all()?;
            partial.persist(&stored).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| InpaintError::model_unavailable(name, "model store task", e))?
        .map_err(|e| InpaintError::model_unavailable(name, "persisting model", e))?;

        debug!("stored `{}` at {}", name, path.display());
        Ok(())
    }
}

/// Derives a file stem from a model name, blocking path traversal.
fn storage_key(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            ' ' => '_',
            _ => '-',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{http_response, serve_once};
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    async fn source_for(response: Vec<u8>) -> Result<HttpModelSource> {
        let url = serve_once(response).await?;
        HttpModelSource::new(ModelRegistry::empty().with_model("inpaint", url))
    }

    fn leftover_parts(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|path| path.to_string_lossy().ends_with(".part"))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn storage_key_is_path_safe() {
        assert_eq!(storage_key("inpaint"), "inpaint");
        assert_eq!(storage_key("mi gan"), "mi_gan");
        assert_eq!(storage_key("../../etc/passwd"), "------etc-passwd");
    }

    #[test]
    fn default_registry_knows_inpaint() {
        let registry = ModelRegistry::default();
        assert_eq!(registry.url(DEFAULT_MODEL), Some(DEFAULT_MODEL_URL));
        assert_eq!(registry.url("super-resolution"), None);
    }

    #[tokio::test]
    async fn fs_store_round_trips_and_leaves_no_partial_file() -> Result<()> {
        let dir = TempDir::new()?;
        let store = FsModelStore::new(dir.path().join("models"));

        assert!(store.load("inpaint").await?.is_none());
        store.save("inpaint", b"onnx-bytes").await?;

        assert_eq!(store.load("inpaint").await?.as_deref(), Some(&b"onnx-bytes"[..]));
        assert!(store.path_for("inpaint").exists());
        assert!(leftover_parts(&dir.path().join("models")).is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_never_interleave() -> Result<()> {
        let dir = TempDir::new()?;
        let payloads: Vec<Vec<u8>> = (0..8_u8).map(|i| vec![i; 256 * 1024]).collect();

        let writes = payloads.iter().map(|payload| {
            let store = FsModelStore::new(dir.path());
            async move { store.save("inpaint", payload).await }
        });
        for result in futures::future::join_all(writes).await {
            result?;
        }

        let stored = FsModelStore::new(dir.path())
            .load("inpaint")
            .await?
            .unwrap_or_default();
        assert!(payloads.contains(&stored), "stored blob mixes several writers");
        assert!(leftover_parts(dir.path()).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn download_streams_the_body_and_reports_progress() -> Result<()> {
        let body: Vec<u8> = (0..4096_u32).map(|i| (i % 251) as u8).collect();
        let source = source_for(http_response("200 OK", body.len() as u64, &body)).await?;
        let (sender, mut receiver) = broadcast::channel(1024);

        let bytes = source
            .fetch("inpaint", &ProgressReporter::new("inpaint", sender))
            .await?;

        assert_eq!(bytes, body);
        let mut percents = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            percents.push(event.percent);
        }
        // 100 is reserved for the cache once the blob is persisted.
        assert_eq!(percents.last(), Some(&99));
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
        Ok(())
    }

    #[tokio::test]
    async fn truncated_body_is_unavailable() -> Result<()> {
        let source = source_for(http_response("200 OK", 10, b"abc")).await?;
        let err = source
            .fetch("inpaint", &ProgressReporter::detached("inpaint"))
            .await
            .unwrap_err();
        assert!(matches!(err, InpaintError::ModelUnavailable { .. }), "{:?}", err);
        Ok(())
    }

    #[tokio::test]
    async fn http_error_status_is_unavailable() -> Result<()> {
        let source = source_for(http_response("404 Not Found", 0, b"")).await?;
        let err = source
            .fetch("inpaint", &ProgressReporter::detached("inpaint"))
            .await
            .unwrap_err();
        assert!(matches!(err, InpaintError::ModelUnavailable { .. }), "{:?}", err);
        Ok(())
    }

    #[tokio::test]
    async fn absurd_content_length_is_an_error_not_an_allocation() -> Result<()> {
        let source = source_for(http_response("200 OK", 100_000_000_000_000, b"abc")).await?;
        let err = source
            .fetch("inpaint", &ProgressReporter::detached("inpaint"))
            .await
            .unwrap_err();
        assert!(matches!(err, InpaintError::ModelUnavailable { .. }), "{:?}", err);
        Ok(())
    }

    #[tokio::test]
    async fn unregistered_model_is_unavailable() -> Result<()> {
        let source = HttpModelSource::new(ModelRegistry::empty())?;
        let err = source
            .fetch("inpaint", &ProgressReporter::detached("inpaint"))
            .await
            .unwrap_err();
        assert!(matches!(err, InpaintError::ModelUnavailable { .. }));
        Ok(())
    }
}
