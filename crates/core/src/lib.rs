//! swarmlm core - cross-device collective communication
//!
//! This crate provides the tensor-parallel communication layer for a
//! distributed LLM inference client:
//!
//! - **Devices**: ordered accelerator groups with a host-memory fallback
//! - **Tensors**: FP32 tensors carrying device-location and contiguity
//!   metadata
//! - **Collectives**: coalesced broadcast, gather, reduce-add, all-reduce,
//!   all-gather, reduce-scatter, each with a fused fast path for uniform
//!   accelerator groups and a per-tensor fallback for mixed device sets
//! - **Autograd**: every collective paired with its adjoint on an operation
//!   tape, so gradients route back to the devices that contributed the
//!   forward inputs
//!
//! Control flow is synchronous; device transfers are issued non-blocking and
//! the operations consuming them are the synchronization points.

pub mod autograd;
pub mod comm;
pub mod device;
pub mod error;
pub mod tensor;

pub use autograd::{CollectiveTape, OpRecord};
pub use device::{Device, DeviceGroup, GpuDevice};
pub use error::{CoreError, Result};
pub use tensor::DeviceTensor;
