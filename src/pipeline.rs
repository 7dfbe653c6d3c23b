use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::capabilities::CapabilitySet;
use crate::engine::{InferenceEngine, OrtSessionFactory};
use crate::errors::{InpaintError, Result};
use crate::mask;
use crate::model_cache::ModelCache;
use crate::model_source::{ModelRegistry, DEFAULT_MODEL};
use crate::raster::{self, ImageSource, OutputImage};
use crate::traits::SessionFactory;

/// Photo + mask in, inpainted photo out.
pub struct Inpainter {
    engine: InferenceEngine,
}

impl Inpainter {
    pub fn new(engine: InferenceEngine) -> Self {
        Self { engine }
    }

    pub fn builder() -> InpainterBuilder {
        InpainterBuilder::default()
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    pub fn model_cache(&self) -> &Arc<ModelCache> {
        self.engine.model_cache()
    }

    /// Runs the full pipeline. Errors from any stage surface unchanged.
    pub async fn inpaint(&self, image: ImageSource, mask: ImageSource) -> Result<OutputImage> {
        let started = Instant::now();
        let (image, mask) = tokio::try_join!(raster::decode(image), mask::decode_mask(mask))?;
        let (width, height) = image.dimensions();
        debug!("decoded {}x{} image", width, height);

        let (image_tensor, mask_tensor) = tokio::try_join!(
            async {
                tokio::task::spawn_blocking(move || raster::interleaved_to_planar(&image))
                    .await
                    .map_err(|e| InpaintError::decode("source image", "image tensor task", e))
            },
            async {
                tokio::task::spawn_blocking(move || mask::build_mask_tensor(&mask, width, height))
                    .await
                    .map_err(|e| InpaintError::mask("mask tensor task", e))
                    .and_then(|tensor| tensor)
            },
        )?;

        let output = self.engine.infer(image_tensor, mask_tensor).await?;
        let pixels = raster::planar_to_interleaved_rgba(output.view(), width, height)?;

        info!("inpainted {}x{} image in {:?}", width, height, started.elapsed());
        Ok(OutputImage::new(pixels))
    }
}

/// Wires the cache, session factory and engine together.
///
/// Defaults: model `inpaint` from [`ModelRegistry::default`], stored under
/// `models/`, real ONNX Runtime sessions, probed capabilities.
#[derive(Default)]
pub struct InpainterBuilder {
    model_name: Option<String>,
    model_url: Option<String>,
    cache_dir: Option<PathBuf>,
    device_id: i32,
    cache: Option<Arc<ModelCache>>,
    factory: Option<Arc<dyn SessionFactory>>,
    capabilities: Option<CapabilitySet>,
}

impl InpainterBuilder {
    pub fn model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = Some(name.into());
        self
    }

    /// Overrides the download URL for the configured model.
    pub fn model_url(mut self, url: impl Into<String>) -> Self {
        self.model_url = Some(url.into());
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub const fn device_id(mut self, device_id: i32) -> Self {
        self.device_id = device_id;
        self
    }

    /// Uses an existing cache instead of building an HTTP-backed one.
    pub fn model_cache(mut self, cache: Arc<ModelCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub const fn capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn build(self) -> Result<Inpainter> {
        let model_name = self.model_name.unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let cache = match self.cache {
            Some(cache) => cache,
            None => {
                let mut registry = ModelRegistry::default();
                if let Some(url) = self.model_url {
                    registry = registry.with_model(model_name.clone(), url);
                }
                let cache_dir = self.cache_dir.unwrap_or_else(|| PathBuf::from("models"));
                Arc::new(ModelCache::http(&cache_dir, registry)?)
            }
        };
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(OrtSessionFactory));

        let mut engine = InferenceEngine::new(cache, factory, model_name).with_device_id(self.device_id);
        if let Some(capabilities) = self.capabilities {
            engine = engine.with_capabilities(capabilities);
        }
        Ok(Inpainter::new(engine))
    }
}
