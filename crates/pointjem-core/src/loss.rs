//! The loss engine: soft coding, joint entropy, transform invariance and the
//! optional cross-rank gather behind a single `compute_loss` call.

use candle_core::{DType, Device, Tensor};

use crate::coding::SoftBlockEncoder;
use crate::comm::Communicator;
use crate::config::LossConfig;
use crate::error::{config_error, context_error, JemError, JemResult};
use crate::gather::FullGather;
use crate::invariance::TransformInvariance;
use crate::joint::JointEntropy;
use crate::partition::BlockPartition;

/// Total objective and its components, all scalar tensors with gradients.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub total: Tensor,
    pub dia: Tensor,
    pub off: Tensor,
    pub ti: Tensor,
}

/// Per-component loss values for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossComponents {
    pub total: f64,
    pub dia: f64,
    pub off: f64,
    pub ti: f64,
}

impl LossComponents {
    pub fn is_finite(&self) -> bool {
        self.total.is_finite() && self.dia.is_finite() && self.off.is_finite() && self.ti.is_finite()
    }
}

fn scalar_value(t: &Tensor) -> JemResult<f64> {
    Ok(t.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?)
}

impl LossOutput {
    /// Reads the four scalars back to the host.
    pub fn components(&self) -> JemResult<LossComponents> {
        Ok(LossComponents {
            total: scalar_value(&self.total)?,
            dia: scalar_value(&self.dia)?,
            off: scalar_value(&self.off)?,
            ti: scalar_value(&self.ti)?,
        })
    }
}

/// `total = dia + off + ti`. Coefficients are already applied by each term.
pub fn aggregate(dia: Tensor, off: Tensor, ti: Tensor) -> JemResult<LossOutput> {
    let total = ((&dia + &off)? + &ti)?;
    Ok(LossOutput { total, dia, off, ti })
}

/// Joint-entropy block-coding loss over two views.
#[derive(Debug, Clone)]
pub struct JemLoss {
    config: LossConfig,
    encoder: SoftBlockEncoder,
    joint: JointEntropy,
    invariance: TransformInvariance,
    gather: Option<FullGather>,
}

impl JemLoss {
    /// Validates `config` against the embedding width and precomputes the
    /// block layout and index tables on `device`.
    pub fn new(config: LossConfig, num_features: usize, device: &Device) -> JemResult<Self> {
        config
            .validate(num_features)
            .map_err(|errors| config_error(errors.join("; ")))?;
        if config.gather {
            return Err(context_error(
                "gather is enabled but no communicator was supplied; use JemLoss::with_communicator",
            ));
        }
        Self::build(config, num_features, device, None)
    }

    /// Like [`JemLoss::new`], gathering across ranks when `config.gather` is set.
    ///
    /// With `gather` disabled the communicator is ignored and the engine runs
    /// on the local batch only.
    pub fn with_communicator(
        config: LossConfig,
        num_features: usize,
        device: &Device,
        comm: Communicator,
    ) -> JemResult<Self> {
        config
            .validate(num_features)
            .map_err(|errors| config_error(errors.join("; ")))?;
        let gather = if config.gather {
            Some(FullGather::new(comm)?)
        } else {
            None
        };
        Self::build(config, num_features, device, gather)
    }

    fn build(
        config: LossConfig,
        num_features: usize,
        device: &Device,
        gather: Option<FullGather>,
    ) -> JemResult<Self> {
        let partition = BlockPartition::new(num_features, config.bin_size)?;
        let encoder = SoftBlockEncoder::new(partition, config.temperature, config.eps)?;
        let joint = JointEntropy::new(
            partition,
            config.dia_coeff,
            config.off_coeff,
            config.check_numerics,
            device,
        )?;
        let invariance = TransformInvariance::new(config.ti_coeff, config.check_numerics);

        tracing::debug!(
            num_features,
            bin_size = partition.bin_size(),
            num_blocks = partition.num_blocks(),
            off_pairs = joint.off_index().len(),
            gather = gather.is_some(),
            "loss engine ready"
        );

        Ok(Self {
            config,
            encoder,
            joint,
            invariance,
            gather,
        })
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    pub fn partition(&self) -> &BlockPartition {
        self.encoder.partition()
    }

    pub fn joint(&self) -> &JointEntropy {
        &self.joint
    }

    pub fn is_gathering(&self) -> bool {
        self.gather.is_some()
    }

    /// Soft codes of one `(N, D)` embedding batch.
    pub fn encode(&self, x: &Tensor) -> JemResult<Tensor> {
        self.encoder.encode(x)
    }

    /// Typed collective failure behind a candle error from `backward`.
    pub fn take_gather_error(&self) -> Option<JemError> {
        self.gather.as_ref().and_then(FullGather::take_error)
    }

    /// `(total, dia, off, ti)` for two `(N, D)` embedding batches.
    ///
    /// The invariance term always sees the local batch; the joint terms see
    /// the gathered batch when gathering is enabled. Both gathers run before
    /// any local check, and the joint check sees every rank's rows, so a
    /// non-finite batch on one rank fails the same way on all of them.
    pub fn compute_loss(&self, view1: &Tensor, view2: &Tensor) -> JemResult<LossOutput> {
        let gathered = match &self.gather {
            Some(gather) => Some((gather.gather(view1)?, gather.gather(view2)?)),
            None => None,
        };

        let local1 = self.encoder.encode_blocks(view1)?;
        let local2 = self.encoder.encode_blocks(view2)?;
        let (loss_dia, loss_off) = match gathered {
            Some((full1, full2)) => self
                .joint
                .forward(&self.encoder.encode(&full1)?, &self.encoder.encode(&full2)?)?,
            None => {
                let n = view1.dim(0)?;
                let d = self.partition().num_features();
                self.joint
                    .forward(&local1.reshape((n, d))?, &local2.reshape((n, d))?)?
            }
        };
        let loss_ti = self.invariance.forward(&local1, &local2)?;

        aggregate(loss_dia, loss_off, loss_ti)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_sums_components() -> JemResult<()> {
        let d = Device::Cpu;
        let out = aggregate(
            Tensor::new(-1.5f32, &d)?,
            Tensor::new(-0.25f32, &d)?,
            Tensor::new(0.75f32, &d)?,
        )?;
        let c = out.components()?;
        assert_eq!(c.total, -1.0);
        assert_eq!(c.dia, -1.5);
        assert_eq!(c.off, -0.25);
        assert_eq!(c.ti, 0.75);
        assert!(c.is_finite());
        Ok(())
    }

    #[test]
    fn test_rejects_indivisible_width_before_forward() {
        let cfg = LossConfig {
            bin_size: 3,
            ..LossConfig::default()
        };
        let err = JemLoss::new(cfg, 10, &Device::Cpu).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_gather_requires_communicator() {
        let cfg = LossConfig {
            bin_size: 4,
            gather: true,
            ..LossConfig::default()
        };
        assert!(JemLoss::new(cfg.clone(), 8, &Device::Cpu)
            .unwrap_err()
            .is_distributed());
        assert!(JemLoss::with_communicator(cfg, 8, &Device::Cpu, Communicator::none())
            .unwrap_err()
            .is_distributed());
    }

    #[test]
    fn test_gather_disabled_ignores_communicator() {
        let cfg = LossConfig {
            bin_size: 4,
            ..LossConfig::default()
        };
        let engine =
            JemLoss::with_communicator(cfg, 8, &Device::Cpu, Communicator::none()).unwrap();
        assert!(!engine.is_gathering());
    }
}
