//! Log-domain guards shared by the entropy terms.

use candle_core::{DType, Tensor};

use crate::error::{JemError, JemResult};

/// Fails with `NumericDomain` unless every entry of `p` is in (0, inf).
pub(crate) fn check_log_domain(p: &Tensor, term: &'static str) -> JemResult<()> {
    let flat = p.detach().flatten_all()?;
    if flat.elem_count() == 0 {
        return Ok(());
    }
    // NaN and inf survive a sum but can be skipped by min.
    let total = flat.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?;
    if !total.is_finite() {
        return Err(JemError::NumericDomain { term, value: total });
    }
    let min = flat.min(0)?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
    if min <= 0.0 {
        return Err(JemError::NumericDomain { term, value: min });
    }
    Ok(())
}

/// `sum(p * log(p))` as a scalar tensor.
pub(crate) fn plogp_sum(p: &Tensor) -> JemResult<Tensor> {
    Ok((p * p.log()?)?.sum_all()?)
}

/// Scalar zero with the dtype and device of `like`.
pub(crate) fn zero_like_scalar(like: &Tensor) -> JemResult<Tensor> {
    Ok(Tensor::zeros((), like.dtype(), like.device())?)
}
