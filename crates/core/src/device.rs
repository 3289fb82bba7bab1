//! Compute devices and ordered device groups
//!
//! A collective operates over an ordered sequence of devices. Order is
//! significant: it defines the source/destination mapping for broadcast and
//! the output ordering for gather/all-gather.

use std::fmt;

#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use crate::error::CoreError;
use crate::error::Result;

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaDevice, CudaSlice, DeviceRepr};

/// Device location for tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda(usize), // GPU device ID
}

impl Device {
    /// Whether this device is an accelerator (eligible for the fused
    /// collective path)
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Accelerator index, if any
    pub fn index(&self) -> Option<usize> {
        match self {
            Device::Cpu => None,
            Device::Cuda(id) => Some(*id),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(id) => write!(f, "cuda:{}", id),
        }
    }
}

/// Accelerator device handle
#[derive(Clone)]
pub struct GpuDevice {
    #[cfg(feature = "cuda")]
    device: Arc<CudaDevice>,
    pub device_id: usize,
}

impl GpuDevice {
    #[cfg(feature = "cuda")]
    pub fn new(device_id: usize) -> Result<Self> {
        let device = CudaDevice::new(device_id)
            .map_err(|e| CoreError::Gpu(format!("failed to open CUDA device {}: {:?}", device_id, e)))?;
        Ok(Self { device, device_id })
    }

    #[cfg(not(feature = "cuda"))]
    pub fn new(device_id: usize) -> Result<Self> {
        Ok(Self { device_id })
    }

    /// Bind this device to the current thread's CUDA context.
    /// Needed when switching between multiple GPUs.
    #[cfg(feature = "cuda")]
    pub fn bind_to_thread(&self) -> Result<()> {
        self.device
            .bind_to_thread()
            .map_err(|e| CoreError::Gpu(format!("failed to bind device to thread: {:?}", e)))
    }

    #[cfg(not(feature = "cuda"))]
    pub fn bind_to_thread(&self) -> Result<()> {
        Ok(())
    }

    /// Wait for all outstanding work on this device
    #[cfg(feature = "cuda")]
    pub fn synchronize(&self) -> Result<()> {
        self.device
            .synchronize()
            .map_err(|e| CoreError::Gpu(format!("failed to synchronize: {:?}", e)))
    }

    #[cfg(not(feature = "cuda"))]
    pub fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    /// Host-to-device copy
    #[cfg(feature = "cuda")]
    pub fn htod<T: DeviceRepr + Clone + Unpin>(&self, data: &[T]) -> Result<CudaSlice<T>> {
        self.device
            .htod_copy(data.to_vec())
            .map_err(|e| CoreError::Gpu(format!("failed to copy to GPU: {:?}", e)))
    }

    /// Device-to-host copy
    #[cfg(feature = "cuda")]
    pub fn dtoh<T: DeviceRepr + Clone + Default>(&self, slice: &CudaSlice<T>) -> Result<Vec<T>> {
        self.device
            .dtoh_sync_copy(slice)
            .map_err(|e| CoreError::Gpu(format!("failed to copy from GPU: {:?}", e)))
    }
}

impl fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuDevice")
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Ordered group of accelerator devices participating in collectives
pub struct DeviceGroup {
    devices: Vec<GpuDevice>,
}

impl DeviceGroup {
    /// Open devices `0..count` in order
    pub fn new(count: usize) -> Result<Self> {
        Self::from_ids(&(0..count).collect::<Vec<_>>())
    }

    /// Open the given device ids, preserving their order
    pub fn from_ids(ids: &[usize]) -> Result<Self> {
        let mut devices = Vec::with_capacity(ids.len());
        for &id in ids {
            devices.push(GpuDevice::new(id)?);
        }
        Ok(Self { devices })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn device(&self, idx: usize) -> &GpuDevice {
        &self.devices[idx]
    }

    /// The ordered device set, as used by the collective primitives
    pub fn device_set(&self) -> Vec<Device> {
        self.devices.iter().map(|d| Device::Cuda(d.device_id)).collect()
    }

    pub fn synchronize_all(&self) -> Result<()> {
        for device in &self.devices {
            device.synchronize()?;
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceGroup")
            .field("len", &self.devices.len())
            .finish()
    }
}
