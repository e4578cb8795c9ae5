//! Joint distribution of two views' soft codes and its two entropy terms.
//!
//! `P12[p, q] = (1/N) * sum_n P1[n, p] * P2[n, q]` estimates how often code
//! dimension `p` of the first view co-activates with dimension `q` of the
//! second. The diagonal term rewards confident agreement on each dimension;
//! the off-block-diagonal term decorrelates different blocks.

use candle_core::{Device, Tensor};

use crate::error::{JemError, JemResult};
use crate::numerics::{check_log_domain, plogp_sum, zero_like_scalar};
use crate::partition::{BlockPartition, OffBlockIndex};

/// Batch-averaged outer product of two `(N, D)` code batches, `(D, D)`.
pub fn joint_distribution(p1: &Tensor, p2: &Tensor) -> JemResult<Tensor> {
    if p1.dims() != p2.dims() || p1.rank() != 2 {
        return Err(JemError::ShapeMismatch {
            expected: p1.dims().to_vec(),
            actual: p2.dims().to_vec(),
        });
    }
    let n = p1.dim(0)?;
    if n == 0 {
        return Err(JemError::ShapeMismatch {
            expected: vec![1, p1.dim(1)?],
            actual: p1.dims().to_vec(),
        });
    }
    Ok(p1.t()?.matmul(p2)?.affine(1.0 / n as f64, 0.0)?)
}

/// Diagonal and off-block-diagonal entropy terms over a fixed block layout.
#[derive(Debug, Clone)]
pub struct JointEntropy {
    partition: BlockPartition,
    off_index: OffBlockIndex,
    diag_index: Tensor,
    dia_coeff: f64,
    off_coeff: f64,
    check_numerics: bool,
}

impl JointEntropy {
    pub fn new(
        partition: BlockPartition,
        dia_coeff: f64,
        off_coeff: f64,
        check_numerics: bool,
        device: &Device,
    ) -> JemResult<Self> {
        let d = partition.num_features();
        let diag: Vec<u32> = (0..d).map(|i| (i * (d + 1)) as u32).collect();
        let diag_index = Tensor::from_vec(diag, d, device)?;
        let off_index = OffBlockIndex::new(partition.num_blocks(), device)?;
        Ok(Self {
            partition,
            off_index,
            diag_index,
            dia_coeff,
            off_coeff,
            check_numerics,
        })
    }

    pub fn off_index(&self) -> &OffBlockIndex {
        &self.off_index
    }

    /// `(loss_dia, loss_off)` for the soft codes of both views.
    pub fn forward(&self, p1: &Tensor, p2: &Tensor) -> JemResult<(Tensor, Tensor)> {
        let p12 = joint_distribution(p1, p2)?;
        let loss_dia = self.diagonal_loss(&p12)?;
        let loss_off = self.off_block_loss(&p12)?;
        Ok((loss_dia, loss_off))
    }

    /// `dia_coeff * sum(diag * log diag) / num_blocks`.
    pub fn diagonal_loss(&self, p12: &Tensor) -> JemResult<Tensor> {
        if self.dia_coeff == 0.0 {
            return zero_like_scalar(p12);
        }
        let diag = self.diagonal(p12)?;
        if self.check_numerics {
            check_log_domain(&diag, "loss_dia")?;
        }
        let scale = self.dia_coeff / self.partition.num_blocks() as f64;
        Ok(plogp_sum(&diag)?.affine(scale, 0.0)?)
    }

    /// `off_coeff * sum(p * log p) / (num_blocks * (num_blocks - 1))` over the
    /// entries of every off-diagonal block. The divisor counts block pairs only.
    pub fn off_block_loss(&self, p12: &Tensor) -> JemResult<Tensor> {
        if self.off_coeff == 0.0 {
            return zero_like_scalar(p12);
        }
        if self.off_index.is_empty() {
            return Err(JemError::Config(
                "off-block term needs at least 2 blocks".to_string(),
            ));
        }
        let entries = self.off_block_entries(p12)?;
        if self.check_numerics {
            check_log_domain(&entries, "loss_off")?;
        }
        let scale = self.off_coeff / self.partition.off_block_pairs() as f64;
        Ok(plogp_sum(&entries)?.affine(scale, 0.0)?)
    }

    /// The `D` diagonal entries of the joint matrix.
    pub fn diagonal(&self, p12: &Tensor) -> JemResult<Tensor> {
        Ok(p12.flatten_all()?.index_select(&self.diag_index, 0)?)
    }

    /// Entries of every `(i, j)` block with `i != j`, flattened pair by pair.
    pub fn off_block_entries(&self, p12: &Tensor) -> JemResult<Tensor> {
        let nb = self.partition.num_blocks();
        let bs = self.partition.bin_size();
        let blocks = p12
            .reshape((nb, bs, nb, bs))?
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((nb * nb, bs * bs))?;
        Ok(blocks.index_select(self.off_index.flat(), 0)?.flatten_all()?)
    }
}
