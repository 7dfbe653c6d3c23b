use std::sync::Arc;
use std::time::Instant;

use ndarray::prelude::*;
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::capabilities::{detect_capabilities, CapabilitySet, GpuProvider};
use crate::errors::{ort_error, InpaintError, Result};
use crate::model_cache::{ModelBlob, ModelCache};
use crate::traits::{InpaintSession, SessionFactory};

/// Hardware path the session executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Gpu(GpuProvider),
    Cpu,
}

/// Everything session construction needs to know about the host, derived
/// once from a [`CapabilitySet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub backend: Backend,
    pub intra_threads: usize,
    /// Allow layout transforms that target vectorized CPU kernels.
    pub vectorized: bool,
    pub device_id: i32,
}

impl SessionConfig {
    /// GPU when available, otherwise CPU with one thread per hardware thread.
    pub fn from_capabilities(capabilities: &CapabilitySet, device_id: i32) -> Self {
        if capabilities.gpu_acceleration {
            return Self {
                backend: Backend::Gpu(capabilities.gpu_provider.unwrap_or(GpuProvider::Cuda)),
                intra_threads: 1,
                vectorized: false,
                device_id,
            };
        }

        Self {
            backend: Backend::Cpu,
            intra_threads: if capabilities.threading {
                capabilities.concurrency
            } else {
                1
            },
            vectorized: capabilities.simd,
            device_id,
        }
    }

    fn optimization_level(&self) -> GraphOptimizationLevel {
        if self.vectorized {
            GraphOptimizationLevel::Level3
        } else {
            GraphOptimizationLevel::Level2
        }
    }

    /// Exactly one provider: the chosen GPU one registered with
    /// `error_on_failure`, or the CPU one. A GPU backend this build cannot
    /// drive is an error, never a quiet switch to CPU.
    pub fn execution_providers(&self) -> Result<Vec<ExecutionProviderDispatch>> {
        match self.backend {
            Backend::Cpu => Ok(vec![CPUExecutionProvider::default()
                .with_arena_allocator(true)
                .build()]),
            Backend::Gpu(provider) => gpu_provider(provider, self.device_id)
                .map(|dispatch| vec![dispatch])
                .ok_or_else(|| {
                    InpaintError::session_init(
                        "execution provider configuration",
                        format!("{:?} was selected but this build does not include it", provider),
                    )
                }),
        }
    }
}

fn gpu_provider(provider: GpuProvider, device_id: i32) -> Option<ExecutionProviderDispatch> {
    match provider {
        #[cfg(feature = "tensorrt")]
        GpuProvider::TensorRt => Some(
            ort::execution_providers::TensorRTExecutionProvider::default()
                .with_device_id(device_id)
                .build()
                .error_on_failure(),
        ),
        #[cfg(feature = "cuda")]
        GpuProvider::Cuda => Some(
            ort::execution_providers::CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build()
                .error_on_failure(),
        ),
        #[allow(unreachable_patterns)]
        _ => {
            let _ = device_id;
            None
        }
    }
}

/// Declared model input/output names, bound by position.
///
/// The inpainting model declares exactly two inputs: the first is the image
/// `[1, 3, H, W]`, the second the mask `[1, 1, H, W]`. Nothing in the model
/// says which is which, so a model that swaps them will run but produce
/// garbage. The first declared output is the inpainted image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBinding {
    pub image: String,
    pub mask: String,
    pub output: String,
}

impl InputBinding {
    pub fn resolve(inputs: &[String], outputs: &[String]) -> Result<Self> {
        let [image, mask] = inputs else {
            return Err(InpaintError::session_init(
                "input binding",
                format!("expected 2 model inputs (image, mask), found {:?}", inputs),
            ));
        };
        let output = outputs.first().ok_or_else(|| {
            InpaintError::session_init("input binding", "model declares no outputs")
        })?;

        Ok(Self {
            image: image.clone(),
            mask: mask.clone(),
            output: output.clone(),
        })
    }
}

/// ONNX Runtime session. `run` needs exclusive access, so concurrent
/// inferences serialize on the lock.
pub struct OrtSession {
    session: Mutex<Session>,
    binding: InputBinding,
}

impl OrtSession {
    pub fn new(model: &ModelBlob, config: &SessionConfig) -> Result<Self> {
        let session = Session::builder()
            .map_err(|e| InpaintError::session_init("session builder initialization", ort_error(e)))?
            .with_execution_providers(config.execution_providers()?)
            .map_err(|e| InpaintError::session_init("execution provider configuration", ort_error(e)))?
            .with_optimization_level(config.optimization_level())
            .map_err(|e| InpaintError::session_init("graph optimization configuration", ort_error(e)))?
            .with_intra_threads(config.intra_threads)
            .map_err(|e| InpaintError::session_init("intra-op thread configuration", ort_error(e)))?
            .with_memory_pattern(true)
            .map_err(|e| InpaintError::session_init("memory pattern configuration", ort_error(e)))?
            .commit_from_memory(model.as_bytes())
            .map_err(|e| {
                InpaintError::session_init(
                    &format!("loading model `{}` ({} bytes)", model.name(), model.len()),
                    ort_error(e),
                )
            })?;

        let inputs: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let outputs: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let binding = InputBinding::resolve(&inputs, &outputs)?;
        debug!(?binding, "model inputs bound");

        Ok(Self {
            session: Mutex::new(session),
            binding,
        })
    }
}

impl InpaintSession for OrtSession {
    fn binding(&self) -> &InputBinding {
        &self.binding
    }

    fn run(&self, image: ArrayView4<u8>, mask: ArrayView4<u8>) -> Result<Array4<u8>> {
        let image = image.as_standard_layout();
        let mask = mask.as_standard_layout();
        let image = TensorRef::from_array_view(&image)
            .map_err(|e| InpaintError::inference("image tensor creation", ort_error(e)))?;
        let mask = TensorRef::from_array_view(&mask)
            .map_err(|e| InpaintError::inference("mask tensor creation", ort_error(e)))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![
                self.binding.image.as_str() => image,
                self.binding.mask.as_str() => mask,
            ])
            .map_err(|e| InpaintError::inference("session run", ort_error(e)))?;

        let output = outputs[self.binding.output.as_str()]
            .try_extract_array::<u8>()
            .map_err(|e| InpaintError::inference("output extraction", ort_error(e)))?
            .into_dimensionality::<Ix4>()?
            .to_owned();
        Ok(output)
    }
}

/// Builds real ONNX Runtime sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrtSessionFactory;

impl SessionFactory for OrtSessionFactory {
    fn create(&self, model: &ModelBlob, config: &SessionConfig) -> Result<Box<dyn InpaintSession>> {
        Ok(Box::new(OrtSession::new(model, config)?))
    }
}

/// Owns the one inference session of the process.
///
/// The session is built on the first `infer` call: capabilities are probed,
/// a [`SessionConfig`] is derived, the model is fetched through the cache and
/// handed to the factory. Concurrent first calls wait for that single
/// construction. A failed construction is reported and not retried on
/// another backend; the next call starts over.
pub struct InferenceEngine {
    cache: Arc<ModelCache>,
    factory: Arc<dyn SessionFactory>,
    model_name: String,
    device_id: i32,
    capabilities: Option<CapabilitySet>,
    session: OnceCell<Arc<dyn InpaintSession>>,
}

impl InferenceEngine {
    pub fn new(cache: Arc<ModelCache>, factory: Arc<dyn SessionFactory>, model_name: impl Into<String>) -> Self {
        Self {
            cache,
            factory,
            model_name: model_name.into(),
            device_id: 0,
            capabilities: None,
            session: OnceCell::new(),
        }
    }

    pub const fn with_device_id(mut self, device_id: i32) -> Self {
        self.device_id = device_id;
        self
    }

    /// Skips host probing; mainly for tests and forced CPU runs.
    pub const fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn model_cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn is_ready(&self) -> bool {
        self.session.initialized()
    }

    /// The memoized session, constructing it on first use.
    pub async fn session(&self) -> Result<Arc<dyn InpaintSession>> {
        self.session
            .get_or_try_init(|| self.construct_session())
            .await
            .cloned()
    }

    async fn construct_session(&self) -> Result<Arc<dyn InpaintSession>> {
        let started = Instant::now();
        let capabilities = self.capabilities.unwrap_or_else(detect_capabilities);
        let config = SessionConfig::from_capabilities(&capabilities, self.device_id);
        info!(
            backend = ?config.backend,
            threads = config.intra_threads,
            vectorized = config.vectorized,
            "configuring inference session"
        );

        let model = self.cache.ensure_model(&self.model_name).await?;

        let factory = Arc::clone(&self.factory);
        let session = tokio::task::spawn_blocking(move || factory.create(&model, &config))
            .await
            .map_err(|e| InpaintError::session_init("session construction task", e))??;

        info!("inference session ready in {:?}", started.elapsed());
        Ok(Arc::from(session))
    }

    /// image `[1, 3, H, W]` + mask `[1, 1, H, W]` -> inpainted `[1, 3, H, W]`.
    pub async fn infer(&self, image: Array4<u8>, mask: Array4<u8>) -> Result<Array4<u8>> {
        let (batch, channels, height, width) = image.dim();
        if batch != 1 || channels != 3 {
            return Err(InpaintError::inference(
                "input validation",
                format!("image tensor must be [1, 3, H, W], got {:?}", image.shape()),
            ));
        }
        if mask.shape() != [1, 1, height, width] {
            return Err(InpaintError::inference(
                "input validation",
                format!(
                    "mask tensor must be [1, 1, {}, {}], got {:?}",
                    height,
                    width,
                    mask.shape()
                ),
            ));
        }

        let session = self.session().await?;
        let started = Instant::now();
        let output = tokio::task::spawn_blocking(move || session.run(image.view(), mask.view()))
            .await
            .map_err(|e| InpaintError::inference("inference task", e))??;
        debug!("inference finished in {:?}", started.elapsed());

        if output.shape() != [1, 3, height, width] {
            return Err(InpaintError::inference(
                "output validation",
                format!(
                    "expected output [1, 3, {}, {}], got {:?}",
                    height,
                    width,
                    output.shape()
                ),
            ));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn gpu_host(provider: Option<GpuProvider>) -> CapabilitySet {
        CapabilitySet {
            gpu_acceleration: true,
            gpu_provider: provider,
            threading: true,
            simd: true,
            concurrency: 16,
        }
    }

    #[test]
    fn gpu_is_preferred_and_single_threaded() {
        let config = SessionConfig::from_capabilities(&gpu_host(Some(GpuProvider::TensorRt)), 1);
        assert_eq!(config.backend, Backend::Gpu(GpuProvider::TensorRt));
        assert_eq!(config.intra_threads, 1);
        assert_eq!(config.device_id, 1);
    }

    #[test]
    fn unnamed_gpu_provider_means_cuda() {
        let config = SessionConfig::from_capabilities(&gpu_host(None), 0);
        assert_eq!(config.backend, Backend::Gpu(GpuProvider::Cuda));
    }

    #[test]
    fn cpu_backend_registers_only_the_cpu_provider() -> Result<()> {
        let config = SessionConfig::from_capabilities(&CapabilitySet::minimal(), 0);
        assert_eq!(config.execution_providers()?.len(), 1);
        Ok(())
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn cuda_backend_without_cuda_build_is_an_error() {
        let config = SessionConfig::from_capabilities(&gpu_host(Some(GpuProvider::Cuda)), 0);
        let err = config.execution_providers().unwrap_err();
        assert!(matches!(err, InpaintError::SessionInit { .. }), "{:?}", err);
    }

    #[cfg(not(feature = "tensorrt"))]
    #[test]
    fn tensorrt_backend_without_tensorrt_build_is_an_error() {
        let config = SessionConfig::from_capabilities(&gpu_host(Some(GpuProvider::TensorRt)), 0);
        let err = config.execution_providers().unwrap_err();
        assert!(matches!(err, InpaintError::SessionInit { .. }), "{:?}", err);
    }

    #[cfg(feature = "cuda")]
    #[test]
    fn cuda_backend_registers_cuda_alone() -> Result<()> {
        let config = SessionConfig::from_capabilities(&gpu_host(Some(GpuProvider::Cuda)), 0);
        let providers = config.execution_providers()?;
        assert_eq!(providers.len(), 1);
        assert!(format!("{:?}", providers[0]).contains("CUDA"));
        Ok(())
    }

    #[cfg(feature = "tensorrt")]
    #[test]
    fn tensorrt_backend_registers_tensorrt_alone() -> Result<()> {
        let config = SessionConfig::from_capabilities(&gpu_host(Some(GpuProvider::TensorRt)), 0);
        let providers = config.execution_providers()?;
        assert_eq!(providers.len(), 1);
        assert!(format!("{:?}", providers[0]).contains("TensorRT"));
        Ok(())
    }

    #[test]
    fn cpu_uses_all_threads_and_vector_kernels() {
        let caps = CapabilitySet {
            gpu_acceleration: false,
            gpu_provider: None,
            threading: true,
            simd: true,
            concurrency: 8,
        };
        let config = SessionConfig::from_capabilities(&caps, 0);
        assert_eq!(config.backend, Backend::Cpu);
        assert_eq!(config.intra_threads, 8);
        assert!(config.vectorized);
    }

    #[test]
    fn minimal_host_runs_scalar_single_thread() {
        let config = SessionConfig::from_capabilities(&CapabilitySet::minimal(), 0);
        assert_eq!(config.backend, Backend::Cpu);
        assert_eq!(config.intra_threads, 1);
        assert!(!config.vectorized);
    }

    #[test]
    fn binding_is_positional() -> Result<()> {
        let binding = InputBinding::resolve(&names(&["image", "mask"]), &names(&["result", "aux"]))?;
        assert_eq!(binding.image, "image");
        assert_eq!(binding.mask, "mask");
        assert_eq!(binding.output, "result");

        // Names do not matter, order does.
        let binding = InputBinding::resolve(&names(&["b", "a"]), &names(&["out"]))?;
        assert_eq!((binding.image.as_str(), binding.mask.as_str()), ("b", "a"));
        Ok(())
    }

    #[test]
    fn binding_rejects_unexpected_input_counts() {
        for inputs in [names(&["image"]), names(&["image", "mask", "extra"]), names(&[])] {
            let err = InputBinding::resolve(&inputs, &names(&["out"])).unwrap_err();
            assert!(matches!(err, InpaintError::SessionInit { .. }));
        }
        let err = InputBinding::resolve(&names(&["image", "mask"]), &[]).unwrap_err();
        assert!(matches!(err, InpaintError::SessionInit { .. }));
    }
}
