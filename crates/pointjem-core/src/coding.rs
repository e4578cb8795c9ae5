//! Soft block coding: temperature softmax inside every block of an embedding.

use candle_core::{DType, Tensor, D};

use crate::error::{config_error, JemError, JemResult};
use crate::partition::BlockPartition;

/// Maps an `(N, D)` embedding batch to `(N, D)` soft codes.
///
/// Each block of `bin_size` dimensions becomes a probability distribution with
/// every entry floored at `eps`.
#[derive(Debug, Clone)]
pub struct SoftBlockEncoder {
    partition: BlockPartition,
    temperature: f64,
    eps: f64,
}

impl SoftBlockEncoder {
    pub fn new(partition: BlockPartition, temperature: f64, eps: f64) -> JemResult<Self> {
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(config_error(format!(
                "temperature must be finite and > 0, got {}",
                temperature
            )));
        }
        if !(eps.is_finite() && eps > 0.0) {
            return Err(config_error(format!("eps must be > 0, got {}", eps)));
        }
        Ok(Self {
            partition,
            temperature,
            eps,
        })
    }

    pub fn partition(&self) -> &BlockPartition {
        &self.partition
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Soft codes with the same `(N, D)` layout as the input.
    pub fn encode(&self, x: &Tensor) -> JemResult<Tensor> {
        let (n, d) = self.check_shape(x)?;
        let blocks = self.encode_blocks(x)?;
        Ok(blocks.reshape((n, d))?)
    }

    /// Soft codes as `(N, num_blocks, bin_size)`.
    ///
    /// Half-precision inputs are coded in f32, where `eps` is representable.
    pub fn encode_blocks(&self, x: &Tensor) -> JemResult<Tensor> {
        let (n, _) = self.check_shape(x)?;
        let x = match x.dtype() {
            DType::F16 | DType::BF16 => x.to_dtype(DType::F32)?,
            _ => x.clone(),
        };
        let blocks = x.reshape((n, self.partition.num_blocks(), self.partition.bin_size()))?;
        let scaled = blocks.affine(1.0 / self.temperature, 0.0)?;

        // Stable softmax: the block max is subtracted before exponentiating.
        let max = scaled.max_keepdim(D::Minus1)?.detach();
        let exp = scaled.broadcast_sub(&max)?.exp()?;
        let sum = exp.sum_keepdim(D::Minus1)?;
        let probs = exp.broadcast_div(&sum)?;

        let floor = Tensor::new(self.eps as f32, probs.device())?.to_dtype(probs.dtype())?;
        Ok(probs.broadcast_maximum(&floor)?)
    }

    fn check_shape(&self, x: &Tensor) -> JemResult<(usize, usize)> {
        let dims = x.dims();
        if dims.len() != 2 || dims[0] == 0 || dims[1] != self.partition.num_features() {
            return Err(JemError::ShapeMismatch {
                expected: vec![
                    dims.first().copied().unwrap_or(0).max(1),
                    self.partition.num_features(),
                ],
                actual: dims.to_vec(),
            });
        }
        Ok((dims[0], dims[1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn encoder(d: usize, bin: usize, t: f64) -> SoftBlockEncoder {
        SoftBlockEncoder::new(BlockPartition::new(d, bin).unwrap(), t, 1e-8).unwrap()
    }

    #[test]
    fn test_rejects_non_positive_temperature() {
        let p = BlockPartition::new(8, 4).unwrap();
        assert!(SoftBlockEncoder::new(p, 0.0, 1e-8).unwrap_err().is_config());
        assert!(SoftBlockEncoder::new(p, -1.0, 1e-8).is_err());
        assert!(SoftBlockEncoder::new(p, f64::NAN, 1e-8).is_err());
    }

    #[test]
    fn test_zero_logits_give_uniform_blocks() -> JemResult<()> {
        let enc = encoder(8, 4, 1.0);
        let x = Tensor::zeros((3, 8), candle_core::DType::F32, &Device::Cpu)?;
        let codes = enc.encode(&x)?.to_vec2::<f32>()?;
        for row in codes {
            for v in row {
                assert!((v - 0.25).abs() < 1e-6);
            }
        }
        Ok(())
    }

    #[test]
    fn test_blocks_are_independent() -> JemResult<()> {
        let enc = encoder(4, 2, 1.0);
        // second block is shifted by a constant: same distribution as the first
        let x = Tensor::new(&[[1.0f32, 3.0, 101.0, 103.0]], &Device::Cpu)?;
        let codes = enc.encode(&x)?.to_vec2::<f32>()?;
        assert!((codes[0][0] - codes[0][2]).abs() < 1e-6);
        assert!((codes[0][1] - codes[0][3]).abs() < 1e-6);
        assert!((codes[0][0] + codes[0][1] - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_temperature_sharpens() -> JemResult<()> {
        let x = Tensor::new(&[[0.0f32, 1.0]], &Device::Cpu)?;
        let warm = encoder(2, 2, 1.0).encode(&x)?.to_vec2::<f32>()?;
        let cold = encoder(2, 2, 0.1).encode(&x)?.to_vec2::<f32>()?;
        assert!(cold[0][1] > warm[0][1]);
        Ok(())
    }

    #[test]
    fn test_floor_applies_to_saturated_blocks() -> JemResult<()> {
        let enc = encoder(4, 4, 1.0);
        let x = Tensor::new(&[[200.0f32, 0.0, 0.0, 0.0]], &Device::Cpu)?;
        let codes = enc.encode(&x)?.to_vec2::<f32>()?;
        assert_eq!(codes[0][0], 1.0);
        for &v in &codes[0][1..] {
            assert!((v - 1e-8).abs() < 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_shape_mismatch() {
        let enc = encoder(8, 4, 1.0);
        let x = Tensor::zeros((2, 6), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            enc.encode(&x),
            Err(JemError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_batch_is_shape_mismatch() {
        let enc = encoder(8, 4, 1.0);
        let x = Tensor::zeros((0, 8), DType::F32, &Device::Cpu).unwrap();
        match enc.encode(&x) {
            Err(JemError::ShapeMismatch { actual, .. }) => assert_eq!(actual, vec![0, 8]),
            other => panic!("expected ShapeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_half_precision_keeps_floor() -> JemResult<()> {
        let enc = encoder(4, 4, 1.0);
        let x = Tensor::new(&[[200.0f32, 0.0, 0.0, 0.0]], &Device::Cpu)?.to_dtype(DType::F16)?;
        let codes = enc.encode(&x)?;
        assert_eq!(codes.dtype(), DType::F32);
        for &v in &codes.to_vec2::<f32>()?[0][1..] {
            assert!(v > 0.0);
        }
        Ok(())
    }
}
