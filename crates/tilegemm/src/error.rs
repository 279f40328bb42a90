//! Error types for the tiled GEMM engine.

use thiserror::Error;

use crate::config::ConfigError;
use crate::context::ContextId;
use crate::device::DeviceClass;
use crate::element::{ElementKind, Operation};

/// Why a request cannot run on the accelerated path.
///
/// Always detected before any device command is issued, so the caller can
/// fall back to another implementation without cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnsupportedReason {
    #[error("{op} is not available for element type {kind}")]
    ElementType { kind: ElementKind, op: Operation },

    #[error("device class {0} cannot run accelerator kernels")]
    DeviceClass(DeviceClass),

    #[error("device has no 2-D image support")]
    NoImageSupport,

    #[error("device does not expose sub-group extensions")]
    NoSubgroups,

    #[error("element type {0} has no staged image format")]
    NoImageFormat(ElementKind),

    #[error("transposed-A matrix-vector product is not implemented")]
    TransposedGemv,

    #[error("inner dimension K is zero")]
    EmptyInnerDimension,

    #[error("geometry {m}x{n}x{k} exceeds the image limit {limit}")]
    ExceedsImageLimit {
        m: usize,
        n: usize,
        k: usize,
        limit: usize,
    },

    #[error("tiled path disabled by configuration")]
    TiledPathDisabled,
}

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum GemmError {
    #[error("unsupported: {0}")]
    Unsupported(#[from] UnsupportedReason),

    #[error("device operation {op} failed: {reason}")]
    Device { op: &'static str, reason: String },

    #[error("invalid invariant: {0}")]
    InvalidInvariant(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("no context registered under id {0}")]
    UnknownContext(ContextId),
}

impl GemmError {
    pub fn device(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Device {
            op,
            reason: reason.into(),
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvalidInvariant(msg.into())
    }

    /// True for the recoverable "use another path" case.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, GemmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_is_distinguished() {
        let err: GemmError = UnsupportedReason::NoSubgroups.into();
        assert!(err.is_unsupported());
        assert!(!GemmError::device("enqueue_kernel", "lost").is_unsupported());
        assert!(!GemmError::invariant("offset").is_unsupported());
    }

    #[test]
    fn messages_carry_context() {
        let err = GemmError::from(UnsupportedReason::ElementType {
            kind: ElementKind::F16,
            op: Operation::TiledGemm,
        });
        assert_eq!(
            err.to_string(),
            "unsupported: tiled-gemm is not available for element type f16"
        );

        let err = GemmError::device("create_image", "CL_OUT_OF_RESOURCES");
        assert!(err.to_string().contains("create_image"));
        assert!(err.to_string().contains("CL_OUT_OF_RESOURCES"));

        let err = GemmError::UnknownContext(ContextId(7));
        assert_eq!(err.to_string(), "no context registered under id ctx#7");
    }
}
