//! Differentiable collective operations
//!
//! Each collective is an explicit (forward-rule, backward-rule) pair. The
//! forward application pushes an [`OpRecord`] onto a [`CollectiveTape`]; the
//! matching backward application consumes that record exactly once and runs
//! the adjoint collective:
//!
//! | forward      | adjoint                                |
//! |--------------|----------------------------------------|
//! | broadcast    | reduce-add onto each source device     |
//! | gather       | split the gradient back to each source |
//! | reduce-add   | broadcast to the recorded sources      |
//! | all-reduce   | all-reduce (self-adjoint)              |
//! | all-gather   | reduce-scatter                         |
//!
//! Gradients are routed to the device list recorded at forward entry, never
//! to the destination device, so every originating device receives a
//! gradient with the shape of its original input.

use crate::comm;
use crate::device::Device;
use crate::error::{CoreError, Result};
use crate::tensor::DeviceTensor;

/// Per-invocation forward state retained for the backward pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpRecord {
    Broadcast {
        sources: Vec<Device>,
        targets: Vec<Device>,
    },
    Gather {
        sources: Vec<Device>,
        dim: usize,
        split_sizes: Vec<usize>,
    },
    ReduceAdd {
        sources: Vec<Device>,
    },
    AllReduce {
        devices: Vec<Device>,
    },
    AllGather {
        devices: Vec<Device>,
        input_shape: Vec<usize>,
    },
}

impl OpRecord {
    fn kind(&self) -> &'static str {
        match self {
            OpRecord::Broadcast { .. } => "broadcast",
            OpRecord::Gather { .. } => "gather",
            OpRecord::ReduceAdd { .. } => "reduce_add",
            OpRecord::AllReduce { .. } => "all_reduce",
            OpRecord::AllGather { .. } => "all_gather",
        }
    }
}

/// Operation tape pairing forward collectives with their adjoints.
///
/// Records are consumed in LIFO order: each `backward_*` call reverses the
/// most recent unconsumed forward application.
#[derive(Debug, Default)]
pub struct CollectiveTape {
    records: Vec<OpRecord>,
}

impl CollectiveTape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unconsumed records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop all unconsumed records
    pub fn clear(&mut self) {
        self.records.clear();
    }

    fn consume(&mut self, expected: &'static str) -> Result<OpRecord> {
        let record = self.records.pop().ok_or_else(|| {
            CoreError::Gradient(format!(
                "no recorded forward operation for {} backward",
                expected
            ))
        })?;
        if record.kind() != expected {
            let kind = record.kind();
            // Leave the mismatched record in place; only a matching backward
            // consumes it.
            self.records.push(record);
            return Err(CoreError::Gradient(format!(
                "backward for {} does not match recorded {} operation",
                expected, kind
            )));
        }
        Ok(record)
    }

    /// Differentiable broadcast; see [`comm::broadcast_coalesced`]
    pub fn broadcast(
        &mut self,
        tensors: &[DeviceTensor],
        devices: &[Device],
    ) -> Result<Vec<Vec<DeviceTensor>>> {
        let out = comm::broadcast_coalesced(tensors, devices)?;
        self.records.push(OpRecord::Broadcast {
            sources: tensors.iter().map(|t| t.device()).collect(),
            targets: devices.to_vec(),
        });
        Ok(out)
    }

    /// Differentiable gather; see [`comm::gather`]
    pub fn gather(
        &mut self,
        tensors: &[DeviceTensor],
        dim: usize,
        destination: Option<Device>,
    ) -> Result<DeviceTensor> {
        let out = comm::gather(tensors, dim, destination)?;
        self.records.push(OpRecord::Gather {
            sources: tensors.iter().map(|t| t.device()).collect(),
            dim,
            split_sizes: tensors.iter().map(|t| t.shape()[dim]).collect(),
        });
        Ok(out)
    }

    /// Differentiable reduce-add; see [`comm::reduce_add`]
    pub fn reduce_add(
        &mut self,
        tensors: &[DeviceTensor],
        destination: Option<Device>,
    ) -> Result<DeviceTensor> {
        let out = comm::reduce_add(tensors, destination)?;
        self.records.push(OpRecord::ReduceAdd {
            sources: tensors.iter().map(|t| t.device()).collect(),
        });
        Ok(out)
    }

    /// Differentiable all-reduce; see [`comm::all_reduce`]
    pub fn all_reduce(&mut self, tensors: &[DeviceTensor]) -> Result<Vec<DeviceTensor>> {
        let out = comm::all_reduce(tensors)?;
        self.records.push(OpRecord::AllReduce {
            devices: tensors.iter().map(|t| t.device()).collect(),
        });
        Ok(out)
    }

    /// Differentiable all-gather; see [`comm::all_gather`]
    pub fn all_gather(&mut self, tensors: &[DeviceTensor]) -> Result<Vec<DeviceTensor>> {
        let out = comm::all_gather(tensors)?;
        self.records.push(OpRecord::AllGather {
            devices: tensors.iter().map(|t| t.device()).collect(),
            input_shape: tensors[0].shape().to_vec(),
        });
        Ok(out)
    }

    /// Adjoint of broadcast: reduce-add each tensor's per-device gradients
    /// onto the device that originally supplied it.
    ///
    /// `grads` uses the forward output layout: `grads[i][j]` is the gradient
    /// for tensor `j` on target device `i`.
    pub fn backward_broadcast(&mut self, grads: &[Vec<DeviceTensor>]) -> Result<Vec<DeviceTensor>> {
        let record = self.consume("broadcast")?;
        let OpRecord::Broadcast { sources, targets } = record else {
            unreachable!("consume checked the record kind");
        };
        if grads.len() != targets.len() {
            return Err(CoreError::Gradient(format!(
                "broadcast backward expects gradients for {} devices, got {}",
                targets.len(),
                grads.len()
            )));
        }
        for row in grads {
            if row.len() != sources.len() {
                return Err(CoreError::Gradient(format!(
                    "broadcast backward expects {} gradients per device, got {}",
                    sources.len(),
                    row.len()
                )));
            }
        }
        sources
            .iter()
            .enumerate()
            .map(|(j, &source)| {
                let column: Vec<DeviceTensor> = grads.iter().map(|row| row[j].clone()).collect();
                comm::reduce_add(&column, Some(source))
            })
            .collect()
    }

    /// Adjoint of gather: split the incoming gradient along the recorded
    /// dimension and scatter the pieces back to the source devices, in the
    /// order of the forward inputs.
    pub fn backward_gather(&mut self, grad: &DeviceTensor) -> Result<Vec<DeviceTensor>> {
        let record = self.consume("gather")?;
        let OpRecord::Gather {
            sources,
            dim,
            split_sizes,
        } = record
        else {
            unreachable!("consume checked the record kind");
        };
        let pieces = grad.split(&split_sizes, dim)?;
        pieces
            .iter()
            .zip(&sources)
            .map(|(piece, &source)| piece.to_device(source))
            .collect()
    }

    /// Adjoint of reduce-add: broadcast the incoming gradient unchanged to
    /// every recorded source device (never the destination).
    pub fn backward_reduce_add(&mut self, grad: &DeviceTensor) -> Result<Vec<DeviceTensor>> {
        let record = self.consume("reduce_add")?;
        let OpRecord::ReduceAdd { sources } = record else {
            unreachable!("consume checked the record kind");
        };
        let nested = comm::broadcast_coalesced(std::slice::from_ref(grad), &sources)?;
        let mut out = Vec::with_capacity(sources.len());
        for mut row in nested {
            match row.pop() {
                Some(g) => out.push(g),
                None => {
                    return Err(CoreError::Gradient(
                        "broadcast dropped a gradient tensor".to_string(),
                    ))
                }
            }
        }
        Ok(out)
    }

    /// Adjoint of all-reduce: all-reduce the incoming per-device gradients.
    pub fn backward_all_reduce(&mut self, grads: &[DeviceTensor]) -> Result<Vec<DeviceTensor>> {
        let record = self.consume("all_reduce")?;
        let OpRecord::AllReduce { devices } = record else {
            unreachable!("consume checked the record kind");
        };
        check_grad_devices(grads, &devices)?;
        comm::all_reduce(grads)
    }

    /// Adjoint of all-gather: reduce-scatter the incoming gradients, summing
    /// across the group and splitting the result back to the per-device
    /// input shape.
    pub fn backward_all_gather(&mut self, grads: &[DeviceTensor]) -> Result<Vec<DeviceTensor>> {
        let record = self.consume("all_gather")?;
        let OpRecord::AllGather {
            devices,
            input_shape,
        } = record
        else {
            unreachable!("consume checked the record kind");
        };
        check_grad_devices(grads, &devices)?;
        let mut expected = Vec::with_capacity(input_shape.len() + 1);
        expected.push(devices.len());
        expected.extend_from_slice(&input_shape);
        for grad in grads {
            if grad.shape() != expected.as_slice() {
                return Err(CoreError::ShapeMismatch {
                    expected: expected.clone(),
                    got: grad.shape().to_vec(),
                });
            }
        }
        comm::reduce_scatter(grads)
    }
}

fn check_grad_devices(grads: &[DeviceTensor], devices: &[Device]) -> Result<()> {
    if grads.len() != devices.len() {
        return Err(CoreError::Gradient(format!(
            "expected one gradient per recorded device ({}), got {}",
            devices.len(),
            grads.len()
        )));
    }
    for (grad, &device) in grads.iter().zip(devices) {
        if grad.device() != device {
            return Err(CoreError::Gradient(format!(
                "gradient on {} does not match recorded device {}",
                grad.device(),
                device
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_pair() -> Vec<DeviceTensor> {
        vec![
            DeviceTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2], Device::Cuda(0)).unwrap(),
            DeviceTensor::from_vec(vec![10.0, 20.0, 30.0, 40.0], &[2, 2], Device::Cuda(1)).unwrap(),
        ]
    }

    #[test]
    fn test_reduce_add_backward_copies_to_sources() {
        let mut tape = CollectiveTape::new();
        let tensors = seeded_pair();

        // Reduce onto a device that is neither source; the adjoint must still
        // route to the recorded sources.
        let out = tape.reduce_add(&tensors, Some(Device::Cuda(5))).unwrap();
        assert_eq!(out.device(), Device::Cuda(5));

        let seed = DeviceTensor::full(&[2, 2], 1.0, Device::Cuda(5));
        let grads = tape.backward_reduce_add(&seed).unwrap();

        assert_eq!(grads.len(), 2);
        assert_eq!(grads[0].device(), Device::Cuda(0));
        assert_eq!(grads[1].device(), Device::Cuda(1));
        for grad in &grads {
            assert_eq!(grad.shape(), &[2, 2]);
            assert_eq!(grad.to_vec(), vec![1.0, 1.0, 1.0, 1.0]);
        }
        assert!(tape.is_empty());
    }

    #[test]
    fn test_all_reduce_backward_is_all_reduce() {
        let mut tape = CollectiveTape::new();
        let tensors = seeded_pair();
        let _ = tape.all_reduce(&tensors).unwrap();

        let grad0 = DeviceTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2], Device::Cuda(0)).unwrap();
        let grad1 = DeviceTensor::from_vec(vec![0.5, 0.5, 0.5, 0.5], &[2, 2], Device::Cuda(1)).unwrap();
        let grads = tape.backward_all_reduce(&[grad0, grad1]).unwrap();

        // Backward of an all-reduced output equals the gradients all-reduced
        // again: summed and rebroadcast.
        assert_eq!(grads.len(), 2);
        for (i, grad) in grads.iter().enumerate() {
            assert_eq!(grad.device(), Device::Cuda(i));
            assert_eq!(grad.to_vec(), vec![1.5, 2.5, 3.5, 4.5]);
        }
    }

    #[test]
    fn test_gather_backward_splits_in_forward_order() {
        let mut tape = CollectiveTape::new();
        let tensors = seeded_pair();
        let gathered = tape.gather(&tensors, 0, Some(Device::Cuda(1))).unwrap();
        assert_eq!(gathered.shape(), &[4, 2]);

        let seed = DeviceTensor::from_vec(
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            &[4, 2],
            Device::Cuda(1),
        )
        .unwrap();
        let grads = tape.backward_gather(&seed).unwrap();

        assert_eq!(grads.len(), 2);
        assert_eq!(grads[0].device(), Device::Cuda(0));
        assert_eq!(grads[0].shape(), &[2, 2]);
        assert_eq!(grads[0].to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(grads[1].device(), Device::Cuda(1));
        assert_eq!(grads[1].to_vec(), vec![5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_all_gather_backward_reduce_scatters() {
        let mut tape = CollectiveTape::new();
        let tensors = vec![
            DeviceTensor::from_vec(vec![1.0, 2.0], &[2], Device::Cuda(0)).unwrap(),
            DeviceTensor::from_vec(vec![3.0, 4.0], &[2], Device::Cuda(1)).unwrap(),
        ];
        let out = tape.all_gather(&tensors).unwrap();
        assert_eq!(out[0].shape(), &[2, 2]);

        let grad0 = DeviceTensor::from_vec(vec![1.0, 1.0, 2.0, 2.0], &[2, 2], Device::Cuda(0)).unwrap();
        let grad1 = DeviceTensor::from_vec(vec![10.0, 10.0, 20.0, 20.0], &[2, 2], Device::Cuda(1)).unwrap();
        let grads = tape.backward_all_gather(&[grad0, grad1]).unwrap();

        // Summed across the group, then split back to the input shape.
        assert_eq!(grads.len(), 2);
        assert_eq!(grads[0].shape(), &[2]);
        assert_eq!(grads[0].device(), Device::Cuda(0));
        assert_eq!(grads[0].to_vec(), vec![11.0, 11.0]);
        assert_eq!(grads[1].shape(), &[2]);
        assert_eq!(grads[1].to_vec(), vec![22.0, 22.0]);
    }

    #[test]
    fn test_broadcast_backward_reduces_per_tensor() {
        let mut tape = CollectiveTape::new();
        let tensors = seeded_pair();
        let targets = [Device::Cuda(0), Device::Cuda(1)];
        let out = tape.broadcast(&tensors, &targets).unwrap();

        // Unit gradient for every broadcast copy
        let grads: Vec<Vec<DeviceTensor>> = out
            .iter()
            .map(|row| {
                row.iter()
                    .map(|t| DeviceTensor::full(t.shape(), 1.0, t.device()))
                    .collect()
            })
            .collect();
        let input_grads = tape.backward_broadcast(&grads).unwrap();

        assert_eq!(input_grads.len(), 2);
        for (grad, tensor) in input_grads.iter().zip(&tensors) {
            assert_eq!(grad.device(), tensor.device());
            assert_eq!(grad.shape(), tensor.shape());
            // Two targets contributed a unit gradient each
            assert_eq!(grad.to_vec(), vec![2.0, 2.0, 2.0, 2.0]);
        }
    }

    #[test]
    fn test_record_consumed_exactly_once() {
        let mut tape = CollectiveTape::new();
        let tensors = seeded_pair();
        let out = tape.reduce_add(&tensors, None).unwrap();
        assert_eq!(tape.len(), 1);

        let _ = tape.backward_reduce_add(&out).unwrap();
        assert!(tape.is_empty());

        let err = tape.backward_reduce_add(&out).unwrap_err();
        assert!(matches!(err, CoreError::Gradient(_)));
    }

    #[test]
    fn test_backward_kind_must_match_record() {
        let mut tape = CollectiveTape::new();
        let tensors = seeded_pair();
        let gathered = tape.gather(&tensors, 0, None).unwrap();

        let err = tape.backward_reduce_add(&gathered).unwrap_err();
        assert!(matches!(err, CoreError::Gradient(_)));
        // The mismatched call must not consume the record
        assert_eq!(tape.len(), 1);
        assert!(tape.backward_gather(&gathered).is_ok());
    }

    #[test]
    fn test_tape_unwinds_in_lifo_order() {
        let mut tape = CollectiveTape::new();
        let tensors = seeded_pair();

        let reduced = tape.reduce_add(&tensors, None).unwrap();
        let gathered = tape.gather(&tensors, 1, None).unwrap();
        assert_eq!(tape.len(), 2);

        let _ = tape.backward_gather(&gathered).unwrap();
        let _ = tape.backward_reduce_add(&reduced).unwrap();
        assert!(tape.is_empty());
    }

    #[test]
    fn test_all_reduce_backward_checks_devices() {
        let mut tape = CollectiveTape::new();
        let tensors = seeded_pair();
        let _ = tape.all_reduce(&tensors).unwrap();

        let wrong = vec![
            DeviceTensor::zeros(&[2, 2], Device::Cuda(3)),
            DeviceTensor::zeros(&[2, 2], Device::Cuda(1)),
        ];
        let err = tape.backward_all_reduce(&wrong).unwrap_err();
        assert!(matches!(err, CoreError::Gradient(_)));
    }
}
