//! Transform-invariance term: per-sample agreement of the two views' codes.

use candle_core::Tensor;

use crate::error::{JemError, JemResult};
use crate::numerics::{check_log_domain, zero_like_scalar};

/// `-ti_coeff * mean(log(sum_bins p1 * p2))` over every (sample, block).
#[derive(Debug, Clone, Copy)]
pub struct TransformInvariance {
    coeff: f64,
    check_numerics: bool,
}

impl TransformInvariance {
    pub fn new(coeff: f64, check_numerics: bool) -> Self {
        Self {
            coeff,
            check_numerics,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.coeff != 0.0
    }

    /// Takes block-shaped codes `(N, num_blocks, bin_size)` of both views.
    pub fn forward(&self, p1: &Tensor, p2: &Tensor) -> JemResult<Tensor> {
        if !self.is_enabled() {
            return zero_like_scalar(p1);
        }
        if p1.dims() != p2.dims() || p1.rank() != 3 {
            return Err(JemError::ShapeMismatch {
                expected: p1.dims().to_vec(),
                actual: p2.dims().to_vec(),
            });
        }
        let (n, nb, bs) = p1.dims3()?;
        let a = p1.reshape((n * nb, bs))?;
        let b = p2.reshape((n * nb, bs))?;
        let sim = (a * b)?.sum(1)?;
        if self.check_numerics {
            check_log_domain(&sim, "loss_ti")?;
        }
        Ok(sim.log()?.mean_all()?.affine(-self.coeff, 0.0)?)
    }
}
