//! Errors surfaced by layer construction and execution.
//!
//! All failures here are structural: bad hyperparameters, mismatched
//! shapes, or device resources that could not be built. Nothing is retried
//! and nothing is silently coerced; a mismatched input is rejected, never
//! truncated or padded. Every variant names the layer it came from so
//! failures in composed networks point at the right place.

use crate::gpu::GpuError;

/// Failures raised while configuring or running a layer.
#[derive(Debug)]
pub enum LayerError {
    /// Invalid hyperparameters or parameter-store misuse, detected at
    /// construction time or on the first compute.
    Config {
        /// Name of the offending layer.
        layer: String,
        /// What was wrong.
        reason: String,
    },
    /// A tensor's shape does not match what the configuration requires.
    ShapeMismatch {
        /// Name of the offending layer.
        layer: String,
        /// The shape the configuration requires.
        expected: Vec<usize>,
        /// The shape that was supplied.
        actual: Vec<usize>,
    },
    /// Device program compilation or buffer allocation failed. Fatal to
    /// the layer: it cannot be used afterwards.
    Resource {
        /// Name of the offending layer.
        layer: String,
        /// The underlying device failure.
        source: GpuError,
    },
}

impl LayerError {
    pub(crate) fn config(layer: &str, reason: impl Into<String>) -> Self {
        Self::Config {
            layer: layer.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(layer: &str, expected: Vec<usize>, actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            layer: layer.to_owned(),
            expected,
            actual: actual.to_vec(),
        }
    }

    pub(crate) fn resource(layer: &str, source: GpuError) -> Self {
        Self::Resource {
            layer: layer.to_owned(),
            source,
        }
    }
}

impl core::fmt::Display for LayerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Config { layer, reason } => {
                write!(f, "layer `{layer}`: {reason}")
            }
            Self::ShapeMismatch {
                layer,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "layer `{layer}`: shape mismatch, expected {expected:?} but got {actual:?}"
                )
            }
            Self::Resource { layer, source } => {
                write!(f, "layer `{layer}`: {source}")
            }
        }
    }
}

impl core::error::Error for LayerError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Resource { source, .. } => Some(source),
            _ => None,
        }
    }
}
