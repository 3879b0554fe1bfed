//! Error taxonomy for the rendering core.
//!
//! Degenerate geometry (NaN camera positions, zero-length light directions) is not
//! represented here: those values flow through the cascade math unchecked and surface
//! as NaN matrices, which keeps upstream bugs visible instead of masking them.

use thiserror::Error;

/// Failures the pipeline reports to its caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Rejected at setup time: bad cascade count, inverted clip planes, zero-sized targets.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A render target could not be allocated. The pipeline cannot run without it.
    #[error("Resource exhaustion allocating '{label}' ({requested_bytes} bytes): {reason}")]
    ResourceExhaustion { label: String, requested_bytes: u64, reason: String },

    /// The adapter cannot use `format` the way the pipeline needs for `target`.
    #[error("Adapter cannot render '{target}' in format {format:?}")]
    UnsupportedFormat { target: String, format: wgpu::TextureFormat },

    /// A render target handle was used after it was destroyed.
    #[error("Stale render target handle (slot {index}, generation {generation})")]
    StaleHandle { index: u32, generation: u32 },
}

impl PipelineError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        PipelineError::InvalidConfig(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::ResourceExhaustion { .. } | PipelineError::UnsupportedFormat { .. })
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
