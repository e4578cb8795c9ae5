//! Training checkpoint save/load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;
use crate::error::{checkpoint_error, IoResultExt, TrainResult};

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const META_FILE: &str = "meta.json";
pub const BACKBONE_FILE: &str = "backbone.safetensors";

const BACKBONE_PREFIX: &str = "backbone.";

/// Metadata stored alongside model weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub config: TrainConfig,
    /// Epochs completed; training resumes at this epoch.
    pub epoch: usize,
    pub step: usize,
    pub loss: f64,
}

/// True when `dir` holds both checkpoint files.
pub fn has_checkpoint(dir: &Path) -> bool {
    dir.join(WEIGHTS_FILE).is_file() && dir.join(META_FILE).is_file()
}

/// Save training checkpoint to directory.
///
/// Creates:
///   - `<dir>/model.safetensors`: model weights
///   - `<dir>/meta.json`: training metadata
pub fn save_checkpoint(
    varmap: &VarMap,
    config: &TrainConfig,
    epoch: usize,
    step: usize,
    loss: f64,
    dir: &Path,
) -> TrainResult<()> {
    std::fs::create_dir_all(dir).with_path(dir)?;

    let weights_path = dir.join(WEIGHTS_FILE);
    varmap
        .save(&weights_path)
        .map_err(|e| checkpoint_error(e.to_string(), &weights_path))?;

    let meta = CheckpointMeta {
        config: config.clone(),
        epoch,
        step,
        loss,
    };
    let json = serde_json::to_string_pretty(&meta)?;
    let meta_path = dir.join(META_FILE);
    std::fs::write(&meta_path, json).with_path(&meta_path)?;

    Ok(())
}

/// Read `meta.json` and load the weights into `varmap`, whose variables must
/// already exist (build the model first).
pub fn load_checkpoint(dir: &Path, varmap: &mut VarMap) -> TrainResult<CheckpointMeta> {
    let meta_path = dir.join(META_FILE);
    let meta_json = std::fs::read_to_string(&meta_path).with_path(&meta_path)?;
    let meta: CheckpointMeta = serde_json::from_str(&meta_json)
        .map_err(|e| checkpoint_error(format!("bad metadata: {}", e), &meta_path))?;

    let weights_path = dir.join(WEIGHTS_FILE);
    varmap
        .load(&weights_path)
        .map_err(|e| checkpoint_error(e.to_string(), &weights_path))?;

    Ok(meta)
}

/// Write only the backbone weights, with the `backbone.` prefix stripped so
/// they load straight into a standalone encoder.
pub fn export_backbone(varmap: &VarMap, dir: &Path) -> TrainResult<PathBuf> {
    std::fs::create_dir_all(dir).with_path(dir)?;
    let path = dir.join(BACKBONE_FILE);

    let tensors: HashMap<String, Tensor> = {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| checkpoint_error("variable map lock poisoned", &path))?;
        data.iter()
            .filter_map(|(name, var)| {
                name.strip_prefix(BACKBONE_PREFIX)
                    .map(|short| (short.to_string(), var.as_tensor().clone()))
            })
            .collect()
    };
    if tensors.is_empty() {
        return Err(checkpoint_error("no backbone variables to export", &path));
    }

    candle_core::safetensors::save(&tensors, &path)
        .map_err(|e| checkpoint_error(e.to_string(), &path))?;
    Ok(path)
}
