//! Point-cloud backbones.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Linear, VarBuilder};

use crate::model::Encoder;

const POINT_MLP: [usize; 4] = [3, 64, 64, 128];

/// Shared per-point `Linear -> BatchNorm -> ReLU` stack followed by a
/// max-pool over points.
pub struct PointNetEncoder {
    point_mlp: Vec<(Linear, BatchNorm)>,
    emb_dims: usize,
}

impl PointNetEncoder {
    pub fn new(emb_dims: usize, vb: VarBuilder) -> Result<Self> {
        let mut widths = POINT_MLP.to_vec();
        widths.push(emb_dims);
        let point_mlp = widths
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                let linear = candle_nn::linear(w[0], w[1], vb.pp(format!("point_mlp.{}", i)))?;
                let bn = candle_nn::batch_norm(
                    w[1],
                    BatchNormConfig::default(),
                    vb.pp(format!("point_bn.{}", i)),
                )?;
                Ok((linear, bn))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            point_mlp,
            emb_dims,
        })
    }
}

impl Encoder for PointNetEncoder {
    /// Batch statistics are taken over every point of every cloud when
    /// `train` is set; running statistics are used otherwise.
    fn forward_t(&self, points: &Tensor, train: bool) -> Result<Tensor> {
        let (b, p, c) = points.dims3()?;
        if c != 3 {
            candle_core::bail!("expected (B, P, 3) points, got {:?}", points.dims());
        }
        let mut h = points.reshape((b * p, c))?;
        for (linear, bn) in &self.point_mlp {
            h = bn.forward_t(&linear.forward(&h)?, train)?.relu()?;
        }
        // symmetric over point order
        h.reshape((b, p, self.emb_dims))?.max(1)
    }

    fn output_dim(&self) -> usize {
        self.emb_dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn encoder(emb_dims: usize) -> Result<(VarMap, PointNetEncoder)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let enc = PointNetEncoder::new(emb_dims, vb)?;
        Ok((varmap, enc))
    }

    #[test]
    fn test_global_feature_shape() -> Result<()> {
        let (_vm, enc) = encoder(32)?;
        let points = Tensor::randn(0f32, 1.0, (4, 50, 3), &Device::Cpu)?;
        assert_eq!(enc.forward_t(&points, true)?.dims(), &[4, 32]);
        assert_eq!(enc.output_dim(), 32);
        Ok(())
    }

    #[test]
    fn test_point_order_invariance() -> Result<()> {
        let (_vm, enc) = encoder(16)?;
        let points = Tensor::randn(0f32, 1.0, (2, 10, 3), &Device::Cpu)?;
        let perm = Tensor::new(&[9u32, 3, 0, 7, 1, 8, 2, 6, 4, 5], &Device::Cpu)?;
        let shuffled = points.index_select(&perm, 1)?;

        let a = enc.forward_t(&points, false)?;
        let b = enc.forward_t(&shuffled, false)?;
        let diff = (a - b)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5, "diff = {}", diff);
        Ok(())
    }

    #[test]
    fn test_train_flag_switches_normalization() -> Result<()> {
        let (_vm, enc) = encoder(16)?;
        let points = Tensor::randn(0f32, 1.0, (3, 12, 3), &Device::Cpu)?.affine(4.0, 2.0)?;
        let train = enc.forward_t(&points, true)?;
        let eval = enc.forward_t(&points, false)?;
        let diff = (train - eval)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff > 1e-3, "diff = {}", diff);
        Ok(())
    }

    #[test]
    fn test_rejects_non_xyz_input() -> Result<()> {
        let (_vm, enc) = encoder(8)?;
        let points = Tensor::zeros((2, 10, 4), DType::F32, &Device::Cpu)?;
        assert!(enc.forward_t(&points, false).is_err());
        Ok(())
    }
}
