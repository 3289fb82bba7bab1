//! Device tensors for collective operations
//!
//! [`DeviceTensor`] carries the metadata the collective layer needs: shape,
//! row-major strides, device location, and contiguity. Storage is an FP32
//! host mirror (the same representation the non-CUDA build of the GPU tensor
//! uses); with the `cuda` feature, cross-device moves additionally stage the
//! data onto the target accelerator.

use std::fmt;
use std::sync::Arc;

use half::bf16;

use crate::device::Device;
#[cfg(feature = "cuda")]
use crate::device::GpuDevice;
use crate::error::{CoreError, Result};

#[cfg(feature = "cuda")]
use cudarc::driver::CudaSlice;

/// Tensor shape utilities
pub mod shape {
    /// Calculate the product of dimensions
    pub fn numel(shape: &[usize]) -> usize {
        shape.iter().product()
    }

    /// Compute strides for row-major layout
    pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }
}

/// A tensor pinned to a compute device
#[derive(Clone)]
pub struct DeviceTensor {
    shape: Vec<usize>,
    strides: Vec<usize>,
    device: Device,
    data: Arc<Vec<f32>>,
    /// Accelerator-resident copy, populated by `to_device` transfers
    #[cfg(feature = "cuda")]
    staged: Option<Arc<CudaSlice<f32>>>,
}

impl DeviceTensor {
    fn from_parts(shape: Vec<usize>, strides: Vec<usize>, device: Device, data: Arc<Vec<f32>>) -> Self {
        Self {
            shape,
            strides,
            device,
            data,
            #[cfg(feature = "cuda")]
            staged: None,
        }
    }

    /// Create a tensor from row-major data
    pub fn from_vec(data: Vec<f32>, shape: &[usize], device: Device) -> Result<Self> {
        if data.len() != shape::numel(shape) {
            return Err(CoreError::DataLength {
                shape: shape.to_vec(),
                got: data.len(),
            });
        }
        let strides = shape::compute_strides(shape);
        Ok(Self::from_parts(shape.to_vec(), strides, device, Arc::new(data)))
    }

    /// Zero-filled tensor
    pub fn zeros(shape: &[usize], device: Device) -> Self {
        let strides = shape::compute_strides(shape);
        let data = vec![0.0; shape::numel(shape)];
        Self::from_parts(shape.to_vec(), strides, device, Arc::new(data))
    }

    /// Constant-filled tensor
    pub fn full(shape: &[usize], value: f32, device: Device) -> Self {
        let strides = shape::compute_strides(shape);
        let data = vec![value; shape::numel(shape)];
        Self::from_parts(shape.to_vec(), strides, device, Arc::new(data))
    }

    /// Create a tensor from little-endian BF16 bytes
    pub fn from_bf16_bytes(bytes: &[u8], shape: &[usize], device: Device) -> Result<Self> {
        let data: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect();
        Self::from_vec(data, shape, device)
    }

    /// Row-major data as little-endian BF16 bytes
    pub fn to_bf16_bytes(&self) -> Vec<u8> {
        self.to_vec()
            .iter()
            .flat_map(|&v| bf16::from_f32(v).to_bits().to_le_bytes())
            .collect()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        shape::numel(&self.shape)
    }

    /// Whether the storage is dense row-major
    pub fn is_contiguous(&self) -> bool {
        self.strides == shape::compute_strides(&self.shape)
    }

    /// Row-major data, materializing strided views
    pub fn to_vec(&self) -> Vec<f32> {
        if self.is_contiguous() {
            return self.data.as_ref().clone();
        }
        let n = self.numel();
        let rank = self.shape.len();
        let mut out = Vec::with_capacity(n);
        let mut coords = vec![0usize; rank];
        for _ in 0..n {
            let offset: usize = coords.iter().zip(&self.strides).map(|(c, s)| c * s).sum();
            out.push(self.data[offset]);
            for d in (0..rank).rev() {
                coords[d] += 1;
                if coords[d] < self.shape[d] {
                    break;
                }
                coords[d] = 0;
            }
        }
        out
    }

    /// Dense row-major copy of this tensor
    pub fn to_contiguous(&self) -> Self {
        if self.is_contiguous() {
            return self.clone();
        }
        let strides = shape::compute_strides(&self.shape);
        Self::from_parts(self.shape.clone(), strides, self.device, Arc::new(self.to_vec()))
    }

    /// Swap two dimensions without copying. The result is a view sharing
    /// storage with `self` and is not contiguous (unless the swap is trivial).
    pub fn transpose(&self, d0: usize, d1: usize) -> Result<Self> {
        let rank = self.rank();
        if d0 >= rank || d1 >= rank {
            return Err(CoreError::InvalidDim {
                dim: d0.max(d1),
                rank,
            });
        }
        let mut shape = self.shape.clone();
        let mut strides = self.strides.clone();
        shape.swap(d0, d1);
        strides.swap(d0, d1);
        Ok(Self::from_parts(shape, strides, self.device, Arc::clone(&self.data)))
    }

    /// Reinterpret the shape; materializes strided views first
    pub fn reshape(&self, new_shape: &[usize]) -> Result<Self> {
        if shape::numel(new_shape) != self.numel() {
            return Err(CoreError::DataLength {
                shape: new_shape.to_vec(),
                got: self.numel(),
            });
        }
        let dense = self.to_contiguous();
        let strides = shape::compute_strides(new_shape);
        Ok(Self::from_parts(new_shape.to_vec(), strides, self.device, dense.data))
    }

    /// Move this tensor to `device`.
    ///
    /// The transfer is issued without waiting for completion; operations that
    /// consume the result act as the synchronization point.
    pub fn to_device(&self, device: Device) -> Result<Self> {
        if device == self.device {
            return Ok(self.clone());
        }
        let dense = self.to_vec();
        let strides = shape::compute_strides(&self.shape);
        #[allow(unused_mut)]
        let mut moved = Self::from_parts(self.shape.clone(), strides, device, Arc::new(dense));
        #[cfg(feature = "cuda")]
        if let Device::Cuda(id) = device {
            let gpu = GpuDevice::new(id)?;
            gpu.bind_to_thread()?;
            let slice = gpu.htod(moved.data.as_slice())?;
            moved.staged = Some(Arc::new(slice));
        }
        Ok(moved)
    }

    /// Elementwise sum with a tensor of the same shape on the same device
    pub fn add(&self, other: &Self) -> Result<Self> {
        if other.shape != self.shape {
            return Err(CoreError::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        if other.device != self.device {
            return Err(CoreError::DeviceMismatch {
                expected: self.device,
                got: other.device,
            });
        }
        let lhs = self.to_vec();
        let rhs = other.to_vec();
        let sum: Vec<f32> = lhs.iter().zip(&rhs).map(|(a, b)| a + b).collect();
        let strides = shape::compute_strides(&self.shape);
        Ok(Self::from_parts(self.shape.clone(), strides, self.device, Arc::new(sum)))
    }

    /// Concatenate tensors along `dim`, preserving input order
    pub fn cat(parts: &[DeviceTensor], dim: usize) -> Result<DeviceTensor> {
        let first = parts.first().ok_or(CoreError::EmptyGroup)?;
        let rank = first.rank();
        if dim >= rank {
            return Err(CoreError::InvalidDim { dim, rank });
        }
        for part in parts {
            if part.rank() != rank
                || part.shape[..dim] != first.shape[..dim]
                || part.shape[dim + 1..] != first.shape[dim + 1..]
            {
                return Err(CoreError::ShapeMismatch {
                    expected: first.shape.clone(),
                    got: part.shape.clone(),
                });
            }
            if part.device != first.device {
                return Err(CoreError::DeviceMismatch {
                    expected: first.device,
                    got: part.device,
                });
            }
        }

        let outer: usize = first.shape[..dim].iter().product();
        let chunks: Vec<usize> = parts
            .iter()
            .map(|p| p.shape[dim..].iter().product())
            .collect();
        let datas: Vec<Vec<f32>> = parts.iter().map(|p| p.to_vec()).collect();

        let mut out_shape = first.shape.clone();
        out_shape[dim] = parts.iter().map(|p| p.shape[dim]).sum();
        let mut out = Vec::with_capacity(shape::numel(&out_shape));
        for o in 0..outer {
            for (data, &chunk) in datas.iter().zip(&chunks) {
                out.extend_from_slice(&data[o * chunk..(o + 1) * chunk]);
            }
        }
        DeviceTensor::from_vec(out, &out_shape, first.device)
    }

    /// Split along `dim` into pieces of the given sizes, in order
    pub fn split(&self, sizes: &[usize], dim: usize) -> Result<Vec<DeviceTensor>> {
        let rank = self.rank();
        if dim >= rank {
            return Err(CoreError::InvalidDim { dim, rank });
        }
        let total: usize = sizes.iter().sum();
        if total != self.shape[dim] {
            return Err(CoreError::GroupSizeMismatch {
                expected: self.shape[dim],
                got: total,
            });
        }

        let outer: usize = self.shape[..dim].iter().product();
        let inner: usize = self.shape[dim + 1..].iter().product();
        let row = self.shape[dim] * inner;
        let data = self.to_vec();

        let mut pieces: Vec<Vec<f32>> = sizes
            .iter()
            .map(|&sz| Vec::with_capacity(outer * sz * inner))
            .collect();
        for o in 0..outer {
            let base = o * row;
            let mut off = 0;
            for (piece, &sz) in pieces.iter_mut().zip(sizes) {
                piece.extend_from_slice(&data[base + off * inner..base + (off + sz) * inner]);
                off += sz;
            }
        }

        pieces
            .into_iter()
            .zip(sizes)
            .map(|(piece, &sz)| {
                let mut piece_shape = self.shape.clone();
                piece_shape[dim] = sz;
                DeviceTensor::from_vec(piece, &piece_shape, self.device)
            })
            .collect()
    }

    /// Stack same-shape tensors into a new leading dimension
    pub fn stack(parts: &[DeviceTensor]) -> Result<DeviceTensor> {
        let first = parts.first().ok_or(CoreError::EmptyGroup)?;
        for part in parts {
            if part.shape != first.shape {
                return Err(CoreError::ShapeMismatch {
                    expected: first.shape.clone(),
                    got: part.shape.clone(),
                });
            }
            if part.device != first.device {
                return Err(CoreError::DeviceMismatch {
                    expected: first.device,
                    got: part.device,
                });
            }
        }
        let mut out_shape = Vec::with_capacity(first.rank() + 1);
        out_shape.push(parts.len());
        out_shape.extend_from_slice(&first.shape);
        let mut out = Vec::with_capacity(shape::numel(&out_shape));
        for part in parts {
            out.extend_from_slice(&part.to_vec());
        }
        DeviceTensor::from_vec(out, &out_shape, first.device)
    }

    /// Split off the leading dimension into per-index tensors
    pub fn unstack(&self) -> Result<Vec<DeviceTensor>> {
        if self.rank() == 0 {
            return Err(CoreError::InvalidDim { dim: 0, rank: 0 });
        }
        let n = self.shape[0];
        let rest = &self.shape[1..];
        let chunk = shape::numel(rest);
        let data = self.to_vec();
        (0..n)
            .map(|i| DeviceTensor::from_vec(data[i * chunk..(i + 1) * chunk].to_vec(), rest, self.device))
            .collect()
    }
}

impl fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("shape", &self.shape)
            .field("device", &self.device)
            .field("contiguous", &self.is_contiguous())
            .finish()
    }
}
