//! Training loop: two views through a shared encoder, the joint-entropy loss,
//! AdamW with warmup + cosine LR, per-epoch checkpoints and `stats.txt`.

use std::path::Path;
use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use pointjem_core::{Communicator, JemLoss, LossComponents};

use crate::checkpoint;
use crate::config::TrainConfig;
use crate::data::{PointCloudDataset, ViewLoader, ViewSampler};
use crate::error::{config_error, TrainError, TrainResult};
use crate::logging::{log_checkpoint_save, log_training_step, StatsWriter, StepMetrics};
use crate::model::JemModel;
use crate::schedule::warmup_cosine;

/// Training statistics for one step.
#[derive(Debug, Clone)]
pub struct StepStats {
    pub loss: LossComponents,
    pub grad_norm: f64,
    pub lr: f64,
    pub samples_per_sec: f64,
}

/// Main trainer holding model, loss engine and optimizer.
pub struct Trainer {
    pub model: JemModel,
    pub varmap: VarMap,
    loss: JemLoss,
    optimizer: AdamW,
    pub config: TrainConfig,
    pub device: Device,
    pub global_step: usize,
    /// Epochs completed so far.
    pub epoch: usize,
    steps_per_epoch: usize,
    sampler: ViewSampler,
    stats: Option<StatsWriter>,
}

impl Trainer {
    /// Single-process trainer; `config.loss.gather` must be off.
    pub fn new(config: TrainConfig, device: Device) -> TrainResult<Self> {
        Self::build(config, device, None)
    }

    /// Trainer whose loss gathers embeddings across the ranks of `comm` when
    /// `config.loss.gather` is set.
    pub fn with_communicator(
        config: TrainConfig,
        device: Device,
        comm: Communicator,
    ) -> TrainResult<Self> {
        Self::build(config, device, Some(comm))
    }

    fn build(config: TrainConfig, device: Device, comm: Option<Communicator>) -> TrainResult<Self> {
        config
            .validate()
            .map_err(|errors| config_error(errors.join("; ")))?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = JemModel::new(&config, vb)?;
        let num_features = model.num_features();

        let loss = match comm {
            Some(comm) => {
                if config.loss.gather && comm.world_size()? != config.world_size {
                    return Err(config_error(format!(
                        "world_size ({}) does not match the communicator ({})",
                        config.world_size,
                        comm.world_size()?
                    )));
                }
                JemLoss::with_communicator(config.loss.clone(), num_features, &device, comm)?
            }
            None => JemLoss::new(config.loss.clone(), num_features, &device)?,
        };

        let params = ParamsAdamW {
            lr: config.base_lr,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;

        tracing::info!(
            emb_dims = config.emb_dims,
            mlp = %config.mlp,
            num_features,
            bin_size = config.loss.bin_size,
            gather = loss.is_gathering(),
            "trainer ready"
        );

        Ok(Self {
            model,
            varmap,
            loss,
            optimizer,
            config,
            device,
            global_step: 0,
            epoch: 0,
            steps_per_epoch: 1,
            sampler: ViewSampler::default(),
            stats: None,
        })
    }

    pub fn loss_engine(&self) -> &JemLoss {
        &self.loss
    }

    fn is_main_rank(&self) -> bool {
        self.config.rank == 0
    }

    /// Learning rate at `step`, with warmup and decay measured in epochs of
    /// the current loader.
    pub fn lr_at(&self, step: usize) -> f64 {
        warmup_cosine(
            step,
            self.config.warmup_epochs * self.steps_per_epoch,
            self.config.epochs * self.steps_per_epoch,
            self.config.base_lr,
            self.config.end_lr_frac,
        )
    }

    /// Execute a single training step on a `(B, P, 3)` pair of views.
    pub fn train_step(&mut self, view1: &Tensor, view2: &Tensor) -> TrainResult<StepStats> {
        let step_start = Instant::now();
        let lr = self.lr_at(self.global_step);
        self.optimizer.set_learning_rate(lr);

        let (z1, z2) = self.model.forward_views(view1, view2, true)?;
        let out = self.loss.compute_loss(&z1, &z2)?;
        let components = out.components()?;

        // Backward first: gathering peers block in its gradient reduction.
        let grads = out.total.backward().map_err(|e| match self.loss.take_gather_error() {
            Some(typed) => TrainError::Core(typed),
            None => TrainError::from(e),
        })?;
        if !components.total.is_finite() {
            return Err(TrainError::Divergence {
                loss: components.total,
                step: self.global_step,
            });
        }

        let grad_norm = compute_grad_norm(&grads, &self.varmap)?;
        self.optimizer.step(&grads)?;
        self.global_step += 1;

        let elapsed = step_start.elapsed().as_secs_f64();
        let samples = view1.dim(0)? as f64;
        Ok(StepStats {
            loss: components,
            grad_norm,
            lr,
            samples_per_sec: if elapsed > 0.0 { samples / elapsed } else { 0.0 },
        })
    }

    /// Train for one epoch over a dataset, returning the mean loss.
    pub fn train_epoch(&mut self, dataset: &dyn PointCloudDataset, epoch: usize) -> TrainResult<f64> {
        let loader = ViewLoader::new(
            dataset,
            self.sampler,
            self.config.batch_size,
            self.config
                .seed
                .wrapping_add(epoch as u64 * 1000)
                .wrapping_add(self.config.rank as u64 * 7919),
            &self.device,
        );
        let n_batches = loader.n_batches();
        if n_batches == 0 {
            return Err(config_error(format!(
                "dataset of {} clouds yields no full batch of {}",
                dataset.len(),
                self.config.batch_size
            )));
        }
        self.steps_per_epoch = n_batches;

        let mut total_loss = 0.0;
        let mut n_steps = 0;

        for (step, batch) in loader.enumerate() {
            let (view1, view2) = batch?;
            let stats = self.train_step(&view1, &view2)?;
            total_loss += stats.loss.total;
            n_steps += 1;

            if let Some(writer) = self.stats.as_mut() {
                let metrics = StepMetrics {
                    epoch,
                    step,
                    loss: stats.loss.total,
                    loss_dia: stats.loss.dia,
                    loss_off: stats.loss.off,
                    loss_ti: stats.loss.ti,
                    time: writer.elapsed_secs(),
                    lr: stats.lr,
                };
                if writer.record(&metrics)? {
                    log_training_step(&metrics);
                }
            }
        }

        Ok(total_loss / n_steps as f64)
    }

    /// Restore weights and progress from `exp_dir` if it holds a checkpoint.
    /// Returns whether anything was restored. Optimizer moments start fresh.
    pub fn resume(&mut self, exp_dir: &Path) -> TrainResult<bool> {
        if !checkpoint::has_checkpoint(exp_dir) {
            return Ok(false);
        }
        let meta = checkpoint::load_checkpoint(exp_dir, &mut self.varmap)?;
        if meta.config.emb_dims != self.config.emb_dims || meta.config.mlp != self.config.mlp {
            return Err(config_error(format!(
                "checkpoint in {} was trained with emb_dims={} mlp={}",
                exp_dir.display(),
                meta.config.emb_dims,
                meta.config.mlp
            )));
        }
        self.epoch = meta.epoch;
        self.global_step = meta.step;
        tracing::info!(
            epoch = meta.epoch,
            step = meta.step,
            path = %exp_dir.display(),
            "resuming from checkpoint"
        );
        Ok(true)
    }

    /// Runs epochs `self.epoch..config.epochs`. With an experiment directory,
    /// rank 0 appends to `stats.txt`, rewrites the checkpoint after every
    /// epoch and exports the backbone at the end.
    pub fn train_loop(
        &mut self,
        dataset: &dyn PointCloudDataset,
        exp_dir: Option<&Path>,
    ) -> TrainResult<f64> {
        let train_start = Instant::now();
        if let Some(dir) = exp_dir {
            self.resume(dir)?;
            if self.is_main_rank() {
                self.stats = Some(StatsWriter::open(dir, self.config.log_freq_secs)?);
            }
        }

        let mut last_loss = f64::NAN;
        for epoch in self.epoch..self.config.epochs {
            let epoch_start = Instant::now();
            last_loss = self.train_epoch(dataset, epoch)?;
            self.epoch = epoch + 1;

            tracing::info!(
                epoch = epoch + 1,
                epochs = self.config.epochs,
                step = self.global_step,
                loss = last_loss,
                elapsed_secs = epoch_start.elapsed().as_secs_f64(),
                "epoch done"
            );

            if let (Some(dir), true) = (exp_dir, self.is_main_rank()) {
                checkpoint::save_checkpoint(
                    &self.varmap,
                    &self.config,
                    self.epoch,
                    self.global_step,
                    last_loss,
                    dir,
                )?;
                log_checkpoint_save(self.epoch, &dir.display().to_string(), last_loss);
            }
        }

        if let (Some(dir), true) = (exp_dir, self.is_main_rank()) {
            let path = checkpoint::export_backbone(&self.varmap, dir)?;
            tracing::info!(path = %path.display(), "backbone exported");
        }

        tracing::info!(
            steps = self.global_step,
            elapsed_secs = train_start.elapsed().as_secs_f64(),
            "training complete"
        );
        Ok(last_loss)
    }
}

/// Compute total gradient norm across all variables.
pub fn compute_grad_norm(grads: &GradStore, varmap: &VarMap) -> TrainResult<f64> {
    let mut total = 0.0f64;
    for var in varmap.all_vars() {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    Ok(total.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticShapes;

    fn tiny_config() -> TrainConfig {
        TrainConfig {
            emb_dims: 32,
            mlp: "32-16".to_string(),
            num_points: 16,
            batch_size: 4,
            epochs: 3,
            warmup_epochs: 1,
            loss: pointjem_core::LossConfig {
                bin_size: 4,
                ..Default::default()
            },
            ..TrainConfig::tiny_cpu()
        }
    }

    #[test]
    fn test_train_step_loss_finite() -> TrainResult<()> {
        let mut trainer = Trainer::new(tiny_config(), Device::Cpu)?;
        trainer.steps_per_epoch = 10;
        trainer.global_step = 10; // past warmup so lr > 0

        let v1 = Tensor::randn(0f32, 1.0, (4, 16, 3), &trainer.device)?;
        let v2 = Tensor::randn(0f32, 1.0, (4, 16, 3), &trainer.device)?;
        let stats = trainer.train_step(&v1, &v2)?;

        assert!(stats.loss.is_finite(), "loss should be finite: {:?}", stats.loss);
        assert!(stats.grad_norm.is_finite() && stats.grad_norm > 0.0);
        assert!(stats.lr > 0.0);
        assert_eq!(trainer.global_step, 11);
        Ok(())
    }

    #[test]
    fn test_step_updates_weights() -> TrainResult<()> {
        let mut trainer = Trainer::new(tiny_config(), Device::Cpu)?;
        trainer.global_step = 5;
        let snapshot = |t: &Trainer| -> Vec<f32> {
            t.varmap
                .data()
                .lock()
                .unwrap()
                .get("backbone.point_mlp.0.weight")
                .unwrap()
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        };
        let before = snapshot(&trainer);
        let v1 = Tensor::randn(0f32, 1.0, (4, 16, 3), &trainer.device)?;
        let v2 = Tensor::randn(0f32, 1.0, (4, 16, 3), &trainer.device)?;
        trainer.train_step(&v1, &v2)?;
        assert_ne!(before, snapshot(&trainer));
        Ok(())
    }

    #[test]
    fn test_lr_follows_epoch_schedule() -> TrainResult<()> {
        let mut trainer = Trainer::new(tiny_config(), Device::Cpu)?;
        trainer.steps_per_epoch = 10;
        assert_eq!(trainer.lr_at(0), 0.0);
        let peak = trainer.lr_at(10);
        assert!((peak - trainer.config.base_lr).abs() < 1e-12);
        let end = trainer.lr_at(30);
        assert!((end - trainer.config.base_lr * trainer.config.end_lr_frac).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_gather_without_communicator_is_rejected() {
        let mut cfg = tiny_config();
        cfg.loss.gather = true;
        match Trainer::new(cfg, Device::Cpu) {
            Err(TrainError::Core(e)) => assert!(e.is_distributed()),
            other => panic!("expected distributed-context error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut cfg = tiny_config();
        cfg.loss.bin_size = 5;
        assert!(matches!(
            Trainer::new(cfg, Device::Cpu),
            Err(TrainError::Config(_))
        ));
    }

    #[test]
    fn test_train_epoch_requires_full_batch() -> TrainResult<()> {
        let mut trainer = Trainer::new(tiny_config(), Device::Cpu)?;
        let ds = SyntheticShapes::new(3, 16, 0);
        let err = trainer.train_epoch(&ds, 0).unwrap_err();
        assert!(matches!(err, TrainError::Config(_)));
        assert!(!err.is_recoverable());
        assert_eq!(trainer.global_step, 0);
        Ok(())
    }

    #[test]
    fn test_train_epoch_runs_full_batches() -> TrainResult<()> {
        let mut trainer = Trainer::new(tiny_config(), Device::Cpu)?;
        let ds = SyntheticShapes::new(10, 16, 0);
        let mean = trainer.train_epoch(&ds, 0)?;
        assert!(mean.is_finite());
        assert_eq!(trainer.global_step, 2);
        Ok(())
    }
}
