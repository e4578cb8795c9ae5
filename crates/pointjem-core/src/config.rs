//! Loss-engine configuration, resolved once per run.

use serde::{Deserialize, Serialize};

fn default_bin_size() -> usize {
    32
}

fn default_temperature() -> f64 {
    1.0
}

fn default_coeff() -> f64 {
    1.0
}

fn default_eps() -> f64 {
    1e-8 // floor applied after softmax; keeps every log finite
}

fn default_true() -> bool {
    true
}

/// Hyperparameters of the joint-entropy objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    /// Width of one block; the embedding width must be a multiple of it.
    #[serde(default = "default_bin_size")]
    pub bin_size: usize,
    /// Softmax temperature `t > 0`.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Weight of the diagonal entropy term (0 disables it).
    #[serde(default = "default_coeff")]
    pub dia_coeff: f64,
    /// Weight of the off-block-diagonal entropy term (0 disables it).
    #[serde(default = "default_coeff")]
    pub off_coeff: f64,
    /// Weight of the transform-invariance term (0 disables it).
    #[serde(default = "default_coeff")]
    pub ti_coeff: f64,
    /// Probability floor of the soft codes.
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Gather embeddings across ranks before building the joint distribution.
    /// Off by default; requires an explicit communicator.
    #[serde(default)]
    pub gather: bool,
    /// Verify that every probability fed to `log` is in (0, inf).
    #[serde(default = "default_true")]
    pub check_numerics: bool,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            bin_size: default_bin_size(),
            temperature: default_temperature(),
            dia_coeff: default_coeff(),
            off_coeff: default_coeff(),
            ti_coeff: default_coeff(),
            eps: default_eps(),
            gather: false,
            check_numerics: true,
        }
    }
}

impl LossConfig {
    /// Validate against an embedding width, returning every violation found.
    pub fn validate(&self, num_features: usize) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.bin_size == 0 {
            errors.push("bin_size must be > 0".to_string());
        } else if num_features % self.bin_size != 0 {
            errors.push(format!(
                "embedding width ({}) must be divisible by bin_size ({})",
                num_features, self.bin_size
            ));
        }
        if num_features == 0 {
            errors.push("embedding width must be > 0".to_string());
        }

        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            errors.push(format!(
                "temperature must be finite and > 0, got {}",
                self.temperature
            ));
        }
        if !(self.eps.is_finite() && self.eps > 0.0 && self.eps < 1.0) {
            errors.push(format!("eps must be in (0, 1), got {}", self.eps));
        }

        for (name, value) in [
            ("dia_coeff", self.dia_coeff),
            ("off_coeff", self.off_coeff),
            ("ti_coeff", self.ti_coeff),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                errors.push(format!("{} must be finite and >= 0, got {}", name, value));
            }
        }

        if self.off_coeff > 0.0
            && self.bin_size > 0
            && num_features % self.bin_size == 0
            && num_features / self.bin_size < 2
        {
            errors.push(format!(
                "off_coeff > 0 needs at least 2 blocks, got {} (width {} / bin_size {})",
                num_features / self.bin_size,
                num_features,
                self.bin_size
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
