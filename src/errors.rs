use std::path::PathBuf;
use thiserror::Error;

/// Boxed source error carried by every [`InpaintError`] variant.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the inpainting pipeline.
///
/// Each variant belongs to one pipeline component and records the `operation`
/// that failed, so callers can route user-facing messages and retry decisions
/// without parsing strings. Nothing in the core retries on its own.
#[derive(Error, Debug)]
pub enum InpaintError {
    #[error("Decode error: {operation} failed (source: {origin})")]
    Decode {
        origin: String,
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Model unavailable: {operation} failed for model `{model}`")]
    ModelUnavailable {
        model: String,
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Mask processing error: {operation} failed")]
    MaskProcessing {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Session initialization error: {operation} failed")]
    SessionInit {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Inference error: {operation} failed")]
    Inference {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Encode error: {operation} failed")]
    Encode {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, InpaintError>;

impl InpaintError {
    pub fn decode(origin: impl Into<String>, operation: &str, source: impl Into<BoxError>) -> Self {
        Self::Decode {
            origin: origin.into(),
            operation: operation.to_string(),
            source: source.into(),
        }
    }

    pub fn model_unavailable(model: &str, operation: &str, source: impl Into<BoxError>) -> Self {
        Self::ModelUnavailable {
            model: model.to_string(),
            operation: operation.to_string(),
            source: source.into(),
        }
    }

    pub fn mask(operation: &str, source: impl Into<BoxError>) -> Self {
        Self::MaskProcessing {
            operation: operation.to_string(),
            source: source.into(),
        }
    }

    pub fn session_init(operation: &str, source: impl Into<BoxError>) -> Self {
        Self::SessionInit {
            operation: operation.to_string(),
            source: source.into(),
        }
    }

    pub fn inference(operation: &str, source: impl Into<BoxError>) -> Self {
        Self::Inference {
            operation: operation.to_string(),
            source: source.into(),
        }
    }

    pub fn encode(operation: &str, source: impl Into<BoxError>) -> Self {
        Self::Encode {
            operation: operation.to_string(),
            source: source.into(),
        }
    }
}

/// ONNX Runtime errors are flattened to their message.
///
/// Some `ort` error types carry builder state that is not `Send`, and the
/// pipeline moves errors across tokio tasks.
pub(crate) fn ort_error(err: impl std::fmt::Display) -> BoxError {
    err.to_string().into()
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path should construct [`InpaintError::FileSystem`]
/// directly; this is the fallback for bare `?` on I/O calls.
impl From<std::io::Error> for InpaintError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Convert image crate errors to decode errors.
impl From<image::ImageError> for InpaintError {
    fn from(err: image::ImageError) -> Self {
        Self::decode("unknown", "image decoding", err)
    }
}

/// Shape errors only arise while building or reading tensors around a run.
impl From<ndarray::ShapeError> for InpaintError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::inference("tensor shape conversion", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_failed_operation() {
        let err = InpaintError::model_unavailable("inpaint", "download", "connection reset");
        assert_eq!(
            err.to_string(),
            "Model unavailable: download failed for model `inpaint`"
        );
    }

    #[test]
    fn source_chain_is_preserved() {
        use std::error::Error;

        let err = InpaintError::inference("session run", "bad input");
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("bad input"));
    }

    #[test]
    fn errors_cross_task_boundaries() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<InpaintError>();
    }
}
