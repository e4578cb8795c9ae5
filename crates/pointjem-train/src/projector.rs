//! Projector head built from a width string such as `"1024-1024"`.
//!
//! Every hidden width contributes `Linear -> BatchNorm -> ReLU`; the last
//! width is a bias-free `Linear` whose output is the embedding the loss sees.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Linear, VarBuilder};

use crate::error::{config_error, TrainResult};

/// One layer of the projector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSpec {
    Linear {
        in_dim: usize,
        out_dim: usize,
        bias: bool,
    },
    BatchNorm {
        dim: usize,
    },
    Relu,
}

/// Parsed projector layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MlpSpec {
    widths: Vec<usize>,
    layers: Vec<LayerSpec>,
}

impl MlpSpec {
    /// Parse `"w1-w2-...-wk"` on top of a backbone of width `input_dim`.
    pub fn parse(input_dim: usize, mlp: &str) -> TrainResult<Self> {
        if input_dim == 0 {
            return Err(config_error("mlp input width must be > 0"));
        }
        let mut widths = vec![input_dim];
        for part in mlp.split('-') {
            let width: usize = part.trim().parse().map_err(|_| {
                config_error(format!("invalid mlp spec '{}': '{}' is not a width", mlp, part))
            })?;
            if width == 0 {
                return Err(config_error(format!(
                    "invalid mlp spec '{}': widths must be > 0",
                    mlp
                )));
            }
            widths.push(width);
        }

        let last = widths.len() - 1;
        let mut layers = Vec::with_capacity(3 * last);
        for i in 0..last - 1 {
            layers.push(LayerSpec::Linear {
                in_dim: widths[i],
                out_dim: widths[i + 1],
                bias: true,
            });
            layers.push(LayerSpec::BatchNorm { dim: widths[i + 1] });
            layers.push(LayerSpec::Relu);
        }
        layers.push(LayerSpec::Linear {
            in_dim: widths[last - 1],
            out_dim: widths[last],
            bias: false,
        });

        Ok(Self { widths, layers })
    }

    pub fn input_dim(&self) -> usize {
        self.widths[0]
    }

    /// Width of the projected embedding.
    pub fn output_dim(&self) -> usize {
        self.widths[self.widths.len() - 1]
    }

    pub fn widths(&self) -> &[usize] {
        &self.widths
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }
}

enum ProjectorLayer {
    Linear(Linear),
    BatchNorm(BatchNorm),
    Relu,
}

/// Materialized projector.
pub struct Projector {
    spec: MlpSpec,
    layers: Vec<ProjectorLayer>,
}

impl Projector {
    pub fn new(spec: &MlpSpec, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(spec.layers().len());
        for (i, layer) in spec.layers().iter().enumerate() {
            let vb_i = vb.pp(format!("layers.{}", i));
            let built = match *layer {
                LayerSpec::Linear {
                    in_dim,
                    out_dim,
                    bias: true,
                } => ProjectorLayer::Linear(candle_nn::linear(in_dim, out_dim, vb_i)?),
                LayerSpec::Linear {
                    in_dim,
                    out_dim,
                    bias: false,
                } => ProjectorLayer::Linear(candle_nn::linear_no_bias(in_dim, out_dim, vb_i)?),
                LayerSpec::BatchNorm { dim } => ProjectorLayer::BatchNorm(candle_nn::batch_norm(
                    dim,
                    BatchNormConfig::default(),
                    vb_i,
                )?),
                LayerSpec::Relu => ProjectorLayer::Relu,
            };
            layers.push(built);
        }
        Ok(Self {
            spec: spec.clone(),
            layers,
        })
    }

    pub fn spec(&self) -> &MlpSpec {
        &self.spec
    }

    /// `train = true` normalizes with batch statistics and updates the
    /// running estimates.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = x.clone();
        for layer in &self.layers {
            h = match layer {
                ProjectorLayer::Linear(l) => l.forward(&h)?,
                ProjectorLayer::BatchNorm(bn) => bn.forward_t(&h, train)?,
                ProjectorLayer::Relu => h.relu()?,
            };
        }
        Ok(h)
    }
}
