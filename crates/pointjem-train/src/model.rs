//! Backbone + projector with weights shared between the two views.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::backbone::PointNetEncoder;
use crate::config::TrainConfig;
use crate::error::TrainResult;
use crate::projector::{MlpSpec, Projector};

/// Maps a batch of clouds `(B, P, 3)` to global features `(B, output_dim)`.
pub trait Encoder {
    /// `train` selects batch statistics over running statistics.
    fn forward_t(&self, points: &Tensor, train: bool) -> Result<Tensor>;
    fn output_dim(&self) -> usize;
}

pub struct JemModel {
    pub backbone: PointNetEncoder,
    pub projector: Projector,
}

impl JemModel {
    /// Backbone weights live under `backbone.`, projector weights under
    /// `projector.`, so the backbone can be exported on its own.
    pub fn new(config: &TrainConfig, vb: VarBuilder) -> TrainResult<Self> {
        let spec = MlpSpec::parse(config.emb_dims, &config.mlp)?;
        let backbone = PointNetEncoder::new(config.emb_dims, vb.pp("backbone"))?;
        let projector = Projector::new(&spec, vb.pp("projector"))?;
        Ok(Self {
            backbone,
            projector,
        })
    }

    /// Width of the embedding handed to the loss.
    pub fn num_features(&self) -> usize {
        self.projector.spec().output_dim()
    }

    /// `(B, P, 3)` clouds to `(B, num_features)` embeddings.
    pub fn embed(&self, points: &Tensor, train: bool) -> Result<Tensor> {
        let features = self.backbone.forward_t(points, train)?;
        self.projector.forward_t(&features, train)
    }

    /// Embeds both views separately so each gets its own batch statistics.
    pub fn forward_views(
        &self,
        view1: &Tensor,
        view2: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        Ok((self.embed(view1, train)?, self.embed(view2, train)?))
    }
}
