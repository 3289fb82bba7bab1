//! Core error types

use thiserror::Error;

use crate::device::Device;

/// Core result type
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error types
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("device mismatch: expected {expected}, got {got}")]
    DeviceMismatch { expected: Device, got: Device },

    #[error("data length {got} does not match shape {shape:?}")]
    DataLength { shape: Vec<usize>, got: usize },

    #[error("dimension {dim} out of range for rank-{rank} tensor")]
    InvalidDim { dim: usize, rank: usize },

    #[error("collective called on an empty tensor group")]
    EmptyGroup,

    #[error("collective group size mismatch: expected {expected}, got {got}")]
    GroupSizeMismatch { expected: usize, got: usize },

    #[error("gradient routing error: {0}")]
    Gradient(String),
}
