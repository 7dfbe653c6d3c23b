use std::{num::NonZeroUsize, thread};

use once_cell::sync::Lazy;
use tracing::debug;

/// Parallelism assumed when the host refuses to report it.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// GPU execution provider a session is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuProvider {
    TensorRt,
    Cuda,
}

/// What the host can offer the numeric runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySet {
    /// A GPU execution provider (TensorRT or CUDA) is usable.
    pub gpu_acceleration: bool,
    /// The provider that answered the probe. `None` with `gpu_acceleration`
    /// set means "unspecified" and is treated as CUDA.
    pub gpu_provider: Option<GpuProvider>,
    /// More than one hardware thread is available.
    pub threading: bool,
    /// Vector instructions (AVX2/SSE4.1 or NEON) are present.
    pub simd: bool,
    pub concurrency: usize,
}

impl CapabilitySet {
    /// The most conservative set: single-threaded scalar CPU.
    pub const fn minimal() -> Self {
        Self {
            gpu_acceleration: false,
            gpu_provider: None,
            threading: false,
            simd: false,
            concurrency: 1,
        }
    }
}

static CAPABILITIES: Lazy<CapabilitySet> = Lazy::new(probe);

/// Probes the host once per process; later calls return the same set.
///
/// Never fails: a probe that errors reports the feature as absent.
pub fn detect_capabilities() -> CapabilitySet {
    *CAPABILITIES
}

fn probe() -> CapabilitySet {
    let concurrency = thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(DEFAULT_CONCURRENCY);

    let gpu_provider = probe_gpu();
    let capabilities = CapabilitySet {
        gpu_acceleration: gpu_provider.is_some(),
        gpu_provider,
        threading: concurrency > 1,
        simd: probe_simd(),
        concurrency,
    };
    debug!(?capabilities, "host capabilities detected");
    capabilities
}

#[cfg(any(feature = "cuda", feature = "tensorrt"))]
fn provider_available(name: &str, provider: &impl ort::execution_providers::ExecutionProvider) -> bool {
    match provider.is_available() {
        Ok(available) => available,
        Err(e) => {
            debug!("{} availability probe failed: {}", name, e);
            false
        }
    }
}

/// First provider the runtime reports, TensorRT before CUDA.
///
/// ONNX Runtime only answers whether the provider is built into the loaded
/// library; a missing device surfaces later as a session construction error.
fn probe_gpu() -> Option<GpuProvider> {
    #[cfg(feature = "tensorrt")]
    {
        use ort::execution_providers::TensorRTExecutionProvider;
        if provider_available("TensorRT", &TensorRTExecutionProvider::default()) {
            return Some(GpuProvider::TensorRt);
        }
    }

    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::CUDAExecutionProvider;
        if provider_available("CUDA", &CUDAExecutionProvider::default()) {
            return Some(GpuProvider::Cuda);
        }
    }

    None
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn probe_simd() -> bool {
    std::arch::is_x86_feature_detected!("avx2") || std::arch::is_x86_feature_detected!("sse4.1")
}

#[cfg(target_arch = "aarch64")]
fn probe_simd() -> bool {
    std::arch::is_aarch64_feature_detected!("neon")
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
fn probe_simd() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_is_idempotent() {
        let first = detect_capabilities();
        for _ in 0..8 {
            assert_eq!(detect_capabilities(), first);
        }
    }

    #[test]
    fn threading_follows_concurrency() {
        let caps = detect_capabilities();
        assert!(caps.concurrency >= 1);
        assert_eq!(caps.threading, caps.concurrency > 1);
    }

    #[test]
    fn gpu_flag_agrees_with_probed_provider() {
        let caps = detect_capabilities();
        assert_eq!(caps.gpu_acceleration, caps.gpu_provider.is_some());
    }

    #[cfg(not(any(feature = "cuda", feature = "tensorrt")))]
    #[test]
    fn gpu_is_absent_without_gpu_providers() {
        let caps = detect_capabilities();
        assert!(!caps.gpu_acceleration);
        assert_eq!(caps.gpu_provider, None);
    }
}
