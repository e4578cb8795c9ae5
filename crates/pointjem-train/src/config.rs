//! Training configuration for PointJEM pretraining.

use std::path::Path;

use pointjem_core::LossConfig;
use serde::{Deserialize, Serialize};

use crate::error::{config_error, IoResultExt, TrainResult};
use crate::projector::MlpSpec;

fn default_warmup_epochs() -> usize {
    10
}

fn default_end_lr_frac() -> f64 {
    1e-3 // cosine ends at base_lr / 1000
}

fn default_log_freq_secs() -> u64 {
    60
}

fn default_world_size() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

/// Model + training hyperparameter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    // Model
    /// Width of the backbone's global feature.
    pub emb_dims: usize,
    /// Projector widths after the backbone, e.g. "1024-1024".
    pub mlp: String,
    /// Points per cloud.
    pub num_points: usize,

    // Loss
    #[serde(default)]
    pub loss: LossConfig,

    // Optimisation
    pub epochs: usize,
    pub batch_size: usize,
    pub base_lr: f64,
    pub weight_decay: f64,
    #[serde(default = "default_warmup_epochs")]
    pub warmup_epochs: usize,
    #[serde(default = "default_end_lr_frac")]
    pub end_lr_frac: f64,

    // Run
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Minimum seconds between stats lines.
    #[serde(default = "default_log_freq_secs")]
    pub log_freq_secs: u64,
    #[serde(default = "default_world_size")]
    pub world_size: usize,
    #[serde(default)]
    pub rank: usize,
}

impl TrainConfig {
    /// Validate configuration, returning every violation found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.emb_dims == 0 {
            errors.push("emb_dims must be > 0".to_string());
        }
        if self.num_points == 0 {
            errors.push("num_points must be > 0".to_string());
        }
        if self.batch_size < 2 {
            errors.push(format!(
                "batch_size must be >= 2 for batch statistics, got {}",
                self.batch_size
            ));
        }
        if self.epochs == 0 {
            errors.push("epochs must be > 0".to_string());
        }
        if !(self.base_lr.is_finite() && self.base_lr > 0.0) {
            errors.push(format!("base_lr must be > 0, got {}", self.base_lr));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            errors.push(format!("weight_decay must be >= 0, got {}", self.weight_decay));
        }
        if !(0.0..=1.0).contains(&self.end_lr_frac) {
            errors.push(format!("end_lr_frac must be in [0, 1], got {}", self.end_lr_frac));
        }
        if self.warmup_epochs >= self.epochs && self.epochs > 0 {
            errors.push(format!(
                "warmup_epochs ({}) must be < epochs ({})",
                self.warmup_epochs, self.epochs
            ));
        }
        if self.world_size == 0 || self.rank >= self.world_size {
            errors.push(format!(
                "rank ({}) must be < world_size ({})",
                self.rank, self.world_size
            ));
        }

        match MlpSpec::parse(self.emb_dims, &self.mlp) {
            Ok(spec) => {
                if let Err(loss_errors) = self.loss.validate(spec.output_dim()) {
                    errors.extend(loss_errors);
                }
            }
            Err(e) => errors.push(e.to_string()),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Width of the projector output, i.e. the loss engine's D.
    pub fn num_features(&self) -> TrainResult<usize> {
        Ok(MlpSpec::parse(self.emb_dims, &self.mlp)?.output_dim())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> TrainResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).with_path(path)?;
        let cfg: Self = serde_json::from_str(&raw)
            .map_err(|e| config_error(format!("{}: {}", path.display(), e)))?;
        Ok(cfg)
    }

    /// ModelNet40 pretraining defaults: PointNet global feature of 1024,
    /// 1024-1024 projector, 32 blocks of 32 bins.
    pub fn modelnet40() -> Self {
        Self {
            emb_dims: 1024,
            mlp: "1024-1024".to_string(),
            num_points: 1024,
            loss: LossConfig::default(),
            epochs: 200,
            batch_size: 32,
            base_lr: 2.5e-3,
            weight_decay: 1e-6,
            warmup_epochs: 10,
            end_lr_frac: 1e-3,
            seed: 42,
            log_freq_secs: 60,
            world_size: 1,
            rank: 0,
        }
    }

    /// Seconds-scale CPU config for smoke runs.
    pub fn tiny_cpu() -> Self {
        Self {
            emb_dims: 64,
            mlp: "64-32".to_string(),
            num_points: 64,
            loss: LossConfig {
                bin_size: 8,
                ..LossConfig::default()
            },
            epochs: 4,
            batch_size: 8,
            base_lr: 1e-3,
            weight_decay: 1e-6,
            warmup_epochs: 1,
            end_lr_frac: 1e-3,
            seed: 42,
            log_freq_secs: 0,
            world_size: 1,
            rank: 0,
        }
    }
}
