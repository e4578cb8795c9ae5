//! Gradient-preserving all-gather.
//!
//! Forward: every rank contributes its local `(N, D)` batch and receives the
//! `(W * N, D)` concatenation in rank order. Backward: the gradient of the
//! full output (all W slots) is sum-reduced across ranks, then each rank keeps
//! rows `[rank * N, (rank + 1) * N)`. Every rank runs the identical loss on the
//! identical gathered batch, so the reduced slice is the gradient of the
//! global objective with respect to the rows this rank owns.

use std::sync::{Arc, Mutex};

use candle_core::backend::BackendStorage;
use candle_core::{
    bail, CpuStorage, CustomOp1, DType, Device, Layout, Shape, Tensor,
};

use crate::comm::Communicator;
use crate::error::{context_error, JemError, JemResult};

/// Last typed failure raised inside the op. Candle only carries a message
/// across `apply_op1` and `backward`, so the typed error is kept here.
type ErrorSlot = Arc<Mutex<Option<JemError>>>;

/// Hand-written forward/backward pair registered with candle's autograd.
struct AllGatherOp {
    comm: Communicator,
    rank: usize,
    world_size: usize,
    error: ErrorSlot,
}

impl AllGatherOp {
    fn fail(&self, err: JemError) -> candle_core::Error {
        let msg = err.to_string();
        if let Ok(mut slot) = self.error.lock() {
            *slot = Some(err);
        }
        candle_core::Error::Msg(msg)
    }
}

impl CustomOp1 for AllGatherOp {
    fn name(&self) -> &'static str {
        "full-gather"
    }

    fn cpu_fwd(
        &self,
        storage: &CpuStorage,
        layout: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let (rows, cols) = layout.shape().dims2()?;
        let data = match storage {
            CpuStorage::F32(data) => data,
            other => bail!("full-gather expects f32 storage, got {:?}", other.dtype()),
        };
        let local = match layout.contiguous_offsets() {
            Some((start, end)) => &data[start..end],
            None => bail!("full-gather expects a contiguous input"),
        };
        let gathered = self.comm.all_gather(local).map_err(|e| self.fail(e))?;
        if gathered.len() != rows * cols * self.world_size {
            return Err(self.fail(context_error(format!(
                "gathered {} values, expected {}",
                gathered.len(),
                rows * cols * self.world_size
            ))));
        }
        Ok((
            CpuStorage::F32(gathered),
            Shape::from((rows * self.world_size, cols)),
        ))
    }

    fn bwd(
        &self,
        arg: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> candle_core::Result<Option<Tensor>> {
        let (rows, cols) = arg.dims2()?;
        let slots = grad_res
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let summed = self
            .comm
            .all_reduce_sum(&slots)
            .map_err(|e| self.fail(e))?;

        let chunk = rows * cols;
        let start = self.rank * chunk;
        if summed.len() < start + chunk {
            return Err(self.fail(context_error(format!(
                "reduced gradient has {} values, rank {} needs [{}, {})",
                summed.len(),
                self.rank,
                start,
                start + chunk
            ))));
        }
        let local = summed[start..start + chunk].to_vec();
        let grad = Tensor::from_vec(local, (rows, cols), arg.device())?.to_dtype(arg.dtype())?;
        Ok(Some(grad))
    }
}

/// Gradient-preserving gather bound to one rank of a multi-device context.
#[derive(Debug, Clone)]
pub struct FullGather {
    comm: Communicator,
    rank: usize,
    world_size: usize,
    error: ErrorSlot,
}

impl FullGather {
    /// Fails with `DistributedContext` unless `comm` is initialized.
    pub fn new(comm: Communicator) -> JemResult<Self> {
        let rank = comm.rank()?;
        let world_size = comm.world_size()?;
        if world_size == 0 || rank >= world_size {
            return Err(context_error(format!(
                "invalid rank {} for world size {}",
                rank, world_size
            )));
        }
        Ok(Self {
            comm,
            rank,
            world_size,
            error: Arc::new(Mutex::new(None)),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Typed failure left behind by the last forward or backward of the op.
    ///
    /// A collective failing during `backward` reaches the caller as a plain
    /// candle error; this recovers the `DistributedContext` behind it.
    pub fn take_error(&self) -> Option<JemError> {
        self.error.lock().ok().and_then(|mut slot| slot.take())
    }

    /// `(W * N, D)` concatenation of every rank's batch, in rank order.
    ///
    /// Every rank must contribute the same `(N, D)`. The shapes are exchanged
    /// first, so a mismatch fails with `DistributedContext` on every rank.
    pub fn gather(&self, x: &Tensor) -> JemResult<Tensor> {
        let (rows, cols) = x.dims2().map_err(|_| JemError::ShapeMismatch {
            expected: vec![0, 0],
            actual: x.dims().to_vec(),
        })?;
        self.check_peer_shapes(rows, cols)?;

        let op = AllGatherOp {
            comm: self.comm.clone(),
            rank: self.rank,
            world_size: self.world_size,
            error: self.error.clone(),
        };

        // The collective runs on host buffers; to_device keeps the graph intact.
        let device = x.device().clone();
        let dtype = x.dtype();
        let host = x
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .contiguous()?;
        let gathered = host.apply_op1(op).map_err(|e| match self.take_error() {
            Some(typed) => typed,
            None => JemError::from(e),
        })?;
        Ok(gathered.to_dtype(dtype)?.to_device(&device)?)
    }

    fn check_peer_shapes(&self, rows: usize, cols: usize) -> JemResult<()> {
        let shapes = self.comm.all_gather(&[rows as f32, cols as f32])?;
        for (peer, shape) in shapes.chunks(2).enumerate() {
            if shape != [rows as f32, cols as f32] {
                return Err(context_error(format!(
                    "rank {} holds a ({}, {}) batch, rank {} holds ({}, {})",
                    peer, shape[0], shape[1], self.rank, rows, cols
                )));
            }
        }
        Ok(())
    }

    /// The gathered batch as W per-rank `(N, D)` slots.
    pub fn gather_slots(&self, x: &Tensor) -> JemResult<Vec<Tensor>> {
        let full = self.gather(x)?;
        let rows = x.dim(0)?;
        (0..self.world_size)
            .map(|r| Ok(full.narrow(0, r * rows, rows)?))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_without_context_fails_fast() {
        let err = FullGather::new(Communicator::none()).unwrap_err();
        assert!(err.is_distributed());
    }
}
