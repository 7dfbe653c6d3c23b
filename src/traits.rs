use crate::engine::{InputBinding, SessionConfig};
use crate::errors::Result;
use crate::model_cache::{ModelBlob, ProgressReporter};
use async_trait::async_trait;
use ndarray::prelude::*;

/// Where model bytes come from on a cache miss.
#[async_trait]
pub trait ModelSource: Send + Sync {
    /// Fetches the whole model, reporting byte progress as it arrives.
    ///
    /// Implementations must not report 100%; the cache does that once the
    /// blob has been persisted.
    async fn fetch(&self, name: &str, progress: &ProgressReporter) -> Result<Vec<u8>>;
}

/// Persistent storage for downloaded models, keyed by model name.
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// `Ok(None)` means "not stored yet", never a failure.
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Must not leave a partially written blob visible to `load`.
    async fn save(&self, name: &str, bytes: &[u8]) -> Result<()>;
}

/// A loaded inpainting model bound to an execution backend.
pub trait InpaintSession: Send + Sync {
    /// Declared input/output names this session feeds, resolved at construction.
    fn binding(&self) -> &InputBinding;

    /// image `[1, 3, H, W]` + mask `[1, 1, H, W]` -> image `[1, 3, H, W]`.
    fn run(&self, image: ArrayView4<u8>, mask: ArrayView4<u8>) -> Result<Array4<u8>>;
}

/// Builds sessions; the engine calls this at most once per process.
pub trait SessionFactory: Send + Sync {
    fn create(&self, model: &ModelBlob, config: &SessionConfig) -> Result<Box<dyn InpaintSession>>;
}
