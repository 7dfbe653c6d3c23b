pub mod capabilities;
pub mod config;
pub mod engine;
pub mod errors;
pub mod mask;
pub mod model_cache;
pub mod model_source;
pub mod pipeline;
pub mod raster;
pub mod traits;

pub mod mocks;

pub use capabilities::{detect_capabilities, CapabilitySet, GpuProvider};
pub use config::Config;
pub use engine::{Backend, InferenceEngine, InputBinding, OrtSessionFactory, SessionConfig};
pub use errors::{InpaintError, Result};
pub use model_cache::{DownloadProgress, ModelBlob, ModelCache, ModelState};
pub use model_source::{FsModelStore, HttpModelSource, ModelRegistry, DEFAULT_MODEL};
pub use pipeline::{Inpainter, InpainterBuilder};
pub use raster::{ImageSource, OutputImage};
pub use traits::*;
