//! Cross-device collective communication primitives
//!
//! Each primitive has two execution paths:
//!
//! - **Fast path**: every participating device is an accelerator. Tensors are
//!   coalesced into a single staging buffer and moved with one transfer per
//!   device, minimizing launch overhead.
//! - **Fallback path**: the device set is non-uniform (host memory involved).
//!   Every tensor is copied independently with non-blocking transfers.
//!
//! Both paths produce identical results; the operations that consume the
//! transferred data (concatenation, summation) act as the implicit
//! synchronization points.
//!
//! # Communication pattern in tensor parallelism
//!
//! ```text
//! Input X (replicated on all devices)
//!     |
//! [column-parallel projections]   -- no communication
//!     |
//! [row-parallel projections]
//!     |
//! all_reduce (sum partial results)
//!     |
//! Output Y (replicated on all devices)
//! ```

use crate::device::Device;
use crate::error::{CoreError, Result};
use crate::tensor::DeviceTensor;

/// Whether every tensor in the group lives on an accelerator
fn all_accelerator(tensors: &[DeviceTensor]) -> bool {
    tensors.iter().all(|t| t.device().is_accelerator())
}

/// Check that every tensor in the group has the same shape
fn validate_uniform(tensors: &[DeviceTensor]) -> Result<&DeviceTensor> {
    let first = tensors.first().ok_or(CoreError::EmptyGroup)?;
    for t in tensors {
        if t.shape() != first.shape() {
            return Err(CoreError::ShapeMismatch {
                expected: first.shape().to_vec(),
                got: t.shape().to_vec(),
            });
        }
    }
    Ok(first)
}

/// Move a whole tensor group to `device` with one coalesced transfer.
///
/// Tensors are flattened into a single staging buffer, moved once, then
/// sliced back apart on the target device.
// TODO: replace the staged round-trip with an NCCL collective once the
// cuda feature grows a communicator.
fn coalesced_to_device(tensors: &[DeviceTensor], device: Device) -> Result<Vec<DeviceTensor>> {
    let mut flat = Vec::new();
    let mut lens = Vec::with_capacity(tensors.len());
    for t in tensors {
        let v = t.to_vec();
        lens.push(v.len());
        flat.extend(v);
    }
    let total: usize = lens.iter().sum();
    let staging = DeviceTensor::from_vec(flat, &[total], tensors[0].device())?;
    let moved = staging.to_device(device)?;
    let pieces = moved.split(&lens, 0)?;
    pieces
        .iter()
        .zip(tensors)
        .map(|(piece, t)| piece.reshape(t.shape()))
        .collect()
}

fn per_tensor_to_device(tensors: &[DeviceTensor], device: Device) -> Result<Vec<DeviceTensor>> {
    tensors.iter().map(|t| t.to_device(device)).collect()
}

/// Distribute each tensor in the group to every device in the set.
///
/// Returns a device-major nesting: `result[i][j]` is tensor `j` on device
/// `i`. Device-set order and input-tensor order are both preserved.
pub fn broadcast_coalesced(
    tensors: &[DeviceTensor],
    devices: &[Device],
) -> Result<Vec<Vec<DeviceTensor>>> {
    if tensors.is_empty() || devices.is_empty() {
        return Err(CoreError::EmptyGroup);
    }
    if devices.iter().all(|d| d.is_accelerator()) {
        fused_broadcast(tensors, devices)
    } else {
        tracing::debug!(op = "broadcast", "non-uniform device set, using per-tensor transfers");
        fallback_broadcast(tensors, devices)
    }
}

fn fused_broadcast(tensors: &[DeviceTensor], devices: &[Device]) -> Result<Vec<Vec<DeviceTensor>>> {
    devices
        .iter()
        .map(|&device| coalesced_to_device(tensors, device))
        .collect()
}

fn fallback_broadcast(
    tensors: &[DeviceTensor],
    devices: &[Device],
) -> Result<Vec<Vec<DeviceTensor>>> {
    let mut out: Vec<Vec<DeviceTensor>> = devices.iter().map(|_| Vec::with_capacity(tensors.len())).collect();
    for x in tensors {
        for (i, &device) in devices.iter().enumerate() {
            out[i].push(x.to_device(device)?);
        }
    }
    Ok(out)
}

/// Concatenate one tensor per device along `dim` onto a single destination.
///
/// `destination` defaults to the device of the first tensor in the group.
/// Input order is preserved in the output.
pub fn gather(
    tensors: &[DeviceTensor],
    dim: usize,
    destination: Option<Device>,
) -> Result<DeviceTensor> {
    let first = tensors.first().ok_or(CoreError::EmptyGroup)?;
    if dim >= first.rank() {
        return Err(CoreError::InvalidDim {
            dim,
            rank: first.rank(),
        });
    }
    let destination = destination.unwrap_or_else(|| first.device());
    let moved = if all_accelerator(tensors) {
        coalesced_to_device(tensors, destination)?
    } else {
        tracing::debug!(op = "gather", "non-uniform device set, using per-tensor transfers");
        per_tensor_to_device(tensors, destination)?
    };
    DeviceTensor::cat(&moved, dim)
}

/// Elementwise-sum one tensor per device onto a single destination.
///
/// `destination` defaults to the device of the first tensor in the group.
pub fn reduce_add(tensors: &[DeviceTensor], destination: Option<Device>) -> Result<DeviceTensor> {
    let first = validate_uniform(tensors)?;
    let destination = destination.unwrap_or_else(|| first.device());
    let moved = if all_accelerator(tensors) {
        coalesced_to_device(tensors, destination)?
    } else {
        tracing::debug!(op = "reduce_add", "non-uniform device set, using per-tensor transfers");
        per_tensor_to_device(tensors, destination)?
    };
    let mut acc = moved[0].clone();
    for t in &moved[1..] {
        acc = acc.add(t)?;
    }
    Ok(acc)
}

/// Sum a tensor group across devices and return the sum to every device.
///
/// Inputs are made contiguous before the collective; the result on device
/// `i` replaces that device's original tensor.
pub fn all_reduce(tensors: &[DeviceTensor]) -> Result<Vec<DeviceTensor>> {
    let first = validate_uniform(tensors)?;
    let inputs: Vec<DeviceTensor> = tensors.iter().map(|t| t.to_contiguous()).collect();
    let total = reduce_add(&inputs, Some(first.device()))?;
    inputs.iter().map(|t| total.to_device(t.device())).collect()
}

/// Gather a tensor group into a new leading dimension, replicated everywhere.
///
/// The output on every device has shape `(group_size,) + input_shape`,
/// equivalent to stacking each device's contribution in group order. Inputs
/// are made contiguous before the collective.
pub fn all_gather(tensors: &[DeviceTensor]) -> Result<Vec<DeviceTensor>> {
    validate_uniform(tensors)?;
    let inputs: Vec<DeviceTensor> = tensors.iter().map(|t| t.to_contiguous()).collect();
    let fast = all_accelerator(&inputs);
    inputs
        .iter()
        .map(|t| {
            let moved = if fast {
                coalesced_to_device(&inputs, t.device())?
            } else {
                per_tensor_to_device(&inputs, t.device())?
            };
            DeviceTensor::stack(&moved)
        })
        .collect()
}

/// Sum a tensor group across devices, then split the result back into
/// per-device shards.
///
/// Every input must have leading dimension equal to the group size; device
/// `i` receives shard `i` with the leading dimension removed.
pub fn reduce_scatter(tensors: &[DeviceTensor]) -> Result<Vec<DeviceTensor>> {
    let first = validate_uniform(tensors)?;
    if first.rank() == 0 {
        return Err(CoreError::InvalidDim { dim: 0, rank: 0 });
    }
    if first.shape()[0] != tensors.len() {
        return Err(CoreError::GroupSizeMismatch {
            expected: tensors.len(),
            got: first.shape()[0],
        });
    }
    let inputs: Vec<DeviceTensor> = tensors.iter().map(|t| t.to_contiguous()).collect();
    let total = reduce_add(&inputs, Some(first.device()))?;
    let shards = total.unstack()?;
    shards
        .into_iter()
        .zip(tensors)
        .map(|(shard, t)| shard.to_device(t.device()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cuda_pair() -> Vec<DeviceTensor> {
        vec![
            DeviceTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2], Device::Cuda(0)).unwrap(),
            DeviceTensor::from_vec(vec![10.0, 20.0, 30.0, 40.0], &[2, 2], Device::Cuda(1)).unwrap(),
        ]
    }

    #[test]
    fn test_broadcast_device_major_layout() {
        let tensors = cuda_pair();
        let devices = [Device::Cuda(0), Device::Cuda(1), Device::Cuda(2)];
        let out = broadcast_coalesced(&tensors, &devices).unwrap();

        assert_eq!(out.len(), 3);
        for (i, per_device) in out.iter().enumerate() {
            assert_eq!(per_device.len(), 2);
            for (j, tensor) in per_device.iter().enumerate() {
                assert_eq!(tensor.device(), devices[i]);
                assert_eq!(tensor.to_vec(), tensors[j].to_vec());
            }
        }
    }

    #[test]
    fn test_broadcast_paths_agree() {
        let tensors = cuda_pair();
        let devices = [Device::Cuda(0), Device::Cuda(1)];
        let fused = fused_broadcast(&tensors, &devices).unwrap();
        let fallback = fallback_broadcast(&tensors, &devices).unwrap();
        for (a, b) in fused.iter().flatten().zip(fallback.iter().flatten()) {
            assert_eq!(a.to_vec(), b.to_vec());
            assert_eq!(a.device(), b.device());
        }
    }

    #[test]
    fn test_broadcast_empty_group() {
        let err = broadcast_coalesced(&[], &[Device::Cpu]).unwrap_err();
        assert!(matches!(err, CoreError::EmptyGroup));
    }

    #[test]
    fn test_gather_preserves_order_and_defaults_destination() {
        let tensors = cuda_pair();
        let gathered = gather(&tensors, 0, None).unwrap();
        assert_eq!(gathered.device(), Device::Cuda(0));
        assert_eq!(gathered.shape(), &[4, 2]);
        assert_eq!(
            gathered.to_vec(),
            vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0]
        );

        // Splitting by the per-device sizes reconstructs the originals
        let parts = gathered.split(&[2, 2], 0).unwrap();
        assert_eq!(parts[0].to_vec(), tensors[0].to_vec());
        assert_eq!(parts[1].to_vec(), tensors[1].to_vec());
    }

    #[test]
    fn test_gather_paths_agree() {
        let tensors = cuda_pair();
        let fast = gather(&tensors, 1, Some(Device::Cuda(0))).unwrap();

        let mixed = vec![
            tensors[0].to_device(Device::Cpu).unwrap(),
            tensors[1].clone(),
        ];
        let slow = gather(&mixed, 1, Some(Device::Cuda(0))).unwrap();
        assert_eq!(fast.to_vec(), slow.to_vec());
        assert_eq!(fast.device(), slow.device());
    }

    #[test]
    fn test_reduce_add_matches_single_device_sum() {
        let tensors = cuda_pair();
        let reduced = reduce_add(&tensors, None).unwrap();
        assert_eq!(reduced.device(), Device::Cuda(0));
        assert_eq!(reduced.to_vec(), vec![11.0, 22.0, 33.0, 44.0]);

        let heterogeneous = vec![
            tensors[0].to_device(Device::Cpu).unwrap(),
            tensors[1].clone(),
        ];
        let slow = reduce_add(&heterogeneous, Some(Device::Cuda(0))).unwrap();
        assert_eq!(slow.to_vec(), reduced.to_vec());
    }

    #[test]
    fn test_reduce_add_rejects_ragged_group() {
        let a = DeviceTensor::zeros(&[2, 2], Device::Cuda(0));
        let b = DeviceTensor::zeros(&[2, 3], Device::Cuda(1));
        let err = reduce_add(&[a, b], None).unwrap_err();
        assert!(matches!(err, CoreError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_all_reduce_replicates_sum() {
        let tensors = cuda_pair();
        let out = all_reduce(&tensors).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].device(), Device::Cuda(0));
        assert_eq!(out[1].device(), Device::Cuda(1));
        for t in &out {
            assert_eq!(t.to_vec(), vec![11.0, 22.0, 33.0, 44.0]);
        }
    }

    #[test]
    fn test_all_reduce_accepts_strided_inputs() {
        let a = DeviceTensor::from_vec((0..6).map(|v| v as f32).collect(), &[2, 3], Device::Cuda(0))
            .unwrap()
            .transpose(0, 1)
            .unwrap();
        let b = DeviceTensor::from_vec(vec![1.0; 6], &[3, 2], Device::Cuda(1)).unwrap();
        assert!(!a.is_contiguous());

        let out = all_reduce(&[a.clone(), b]).unwrap();
        let expected: Vec<f32> = a.to_vec().iter().map(|v| v + 1.0).collect();
        assert_eq!(out[0].to_vec(), expected);
        assert_eq!(out[1].to_vec(), expected);
    }

    #[test]
    fn test_all_gather_stacks_group() {
        let tensors = cuda_pair();
        let out = all_gather(&tensors).unwrap();
        assert_eq!(out.len(), 2);
        for (i, t) in out.iter().enumerate() {
            assert_eq!(t.device(), tensors[i].device());
            assert_eq!(t.shape(), &[2, 2, 2]);
            assert_eq!(
                t.to_vec(),
                vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0]
            );
        }
    }

    #[test]
    fn test_reduce_scatter_shards_sum() {
        let a = DeviceTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2], Device::Cuda(0)).unwrap();
        let b = DeviceTensor::from_vec(vec![10.0, 10.0, 10.0, 10.0], &[2, 2], Device::Cuda(1)).unwrap();
        let out = reduce_scatter(&[a, b]).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].device(), Device::Cuda(0));
        assert_eq!(out[0].shape(), &[2]);
        assert_eq!(out[0].to_vec(), vec![11.0, 12.0]);
        assert_eq!(out[1].device(), Device::Cuda(1));
        assert_eq!(out[1].to_vec(), vec![13.0, 14.0]);
    }

    #[test]
    fn test_reduce_scatter_requires_group_sized_leading_dim() {
        let a = DeviceTensor::zeros(&[3, 2], Device::Cuda(0));
        let b = DeviceTensor::zeros(&[3, 2], Device::Cuda(1));
        let err = reduce_scatter(&[a, b]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::GroupSizeMismatch { expected: 2, got: 3 }
        ));
    }
}
