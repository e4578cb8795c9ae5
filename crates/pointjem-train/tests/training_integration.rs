//! End-to-end training runs on synthetic shapes.

use std::sync::Arc;
use std::thread;

use candle_core::{Device, Tensor};
use pointjem_core::{Collective, Communicator, JemError, JemResult, LocalGroup, LossConfig};
use pointjem_train::checkpoint::{BACKBONE_FILE, META_FILE, WEIGHTS_FILE};
use pointjem_train::data::SyntheticShapes;
use pointjem_train::{TrainConfig, TrainError, TrainResult, Trainer};

fn tiny_config(epochs: usize) -> TrainConfig {
    TrainConfig {
        emb_dims: 32,
        mlp: "32-16".to_string(),
        num_points: 16,
        batch_size: 4,
        epochs,
        warmup_epochs: 1,
        log_freq_secs: 0,
        loss: LossConfig {
            bin_size: 4,
            ..LossConfig::default()
        },
        ..TrainConfig::tiny_cpu()
    }
}

#[test]
fn test_train_loop_writes_experiment_dir() -> TrainResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let ds = SyntheticShapes::new(8, 16, 11);
    let mut trainer = Trainer::new(tiny_config(2), Device::Cpu)?;

    let loss = trainer.train_loop(&ds, Some(dir.path()))?;
    assert!(loss.is_finite());
    assert_eq!(trainer.epoch, 2);
    assert_eq!(trainer.global_step, 4);

    for file in [WEIGHTS_FILE, META_FILE, BACKBONE_FILE, "stats.txt"] {
        assert!(dir.path().join(file).is_file(), "missing {}", file);
    }

    let stats = std::fs::read_to_string(dir.path().join("stats.txt")).unwrap();
    let lines: Vec<serde_json::Value> = stats
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 4);
    for line in &lines {
        let total = line["loss"].as_f64().unwrap();
        let parts = line["loss_dia"].as_f64().unwrap()
            + line["loss_off"].as_f64().unwrap()
            + line["loss_ti"].as_f64().unwrap();
        assert!((total - parts).abs() < 1e-4);
    }
    assert_eq!(lines[0]["lr"].as_f64().unwrap(), 0.0);
    Ok(())
}

#[test]
fn test_resume_continues_from_saved_epoch() -> TrainResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let ds = SyntheticShapes::new(8, 16, 12);

    let mut first = Trainer::new(tiny_config(2), Device::Cpu)?;
    first.train_loop(&ds, Some(dir.path()))?;

    let mut second = Trainer::new(tiny_config(3), Device::Cpu)?;
    assert!(second.resume(dir.path())?);
    assert_eq!(second.epoch, 2);
    assert_eq!(second.global_step, 4);

    second.train_loop(&ds, Some(dir.path()))?;
    assert_eq!(second.epoch, 3);
    assert_eq!(second.global_step, 6);

    let meta: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join(META_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(meta["epoch"], 3);
    assert_eq!(meta["step"], 6);
    Ok(())
}

#[test]
fn test_resume_rejects_other_architecture() -> TrainResult<()> {
    let dir = tempfile::tempdir().unwrap();
    let ds = SyntheticShapes::new(8, 16, 13);
    Trainer::new(tiny_config(2), Device::Cpu)?.train_loop(&ds, Some(dir.path()))?;

    let mut cfg = tiny_config(2);
    cfg.mlp = "32-8".to_string();
    let mut other = Trainer::new(cfg, Device::Cpu)?;
    assert!(other.resume(dir.path()).is_err());
    Ok(())
}

#[test]
fn test_train_loop_without_exp_dir() -> TrainResult<()> {
    let ds = SyntheticShapes::new(8, 16, 14);
    let mut cfg = tiny_config(1);
    cfg.warmup_epochs = 0;
    let mut trainer = Trainer::new(cfg, Device::Cpu)?;
    let loss = trainer.train_loop(&ds, None)?;
    assert!(loss.is_finite());
    assert_eq!(trainer.epoch, 1);
    assert_eq!(trainer.global_step, 2);
    Ok(())
}

#[test]
fn test_gathering_trainers_step_in_lock_step() {
    let peers = LocalGroup::new(2).unwrap();
    let results: Vec<TrainResult<(usize, f64)>> = thread::scope(|s| {
        let handles: Vec<_> = peers
            .into_iter()
            .enumerate()
            .map(|(rank, peer)| {
                s.spawn(move || -> TrainResult<(usize, f64)> {
                    let mut cfg = tiny_config(2);
                    cfg.world_size = 2;
                    cfg.rank = rank;
                    cfg.loss.gather = true;
                    let mut trainer =
                        Trainer::with_communicator(cfg, Device::Cpu, Communicator::from(peer))?;
                    assert!(trainer.loss_engine().is_gathering());
                    trainer.global_step = 10;

                    let v1 = Tensor::randn(0f32, 1.0, (4, 16, 3), &Device::Cpu)?;
                    let v2 = Tensor::randn(0f32, 1.0, (4, 16, 3), &Device::Cpu)?;
                    let stats = trainer.train_step(&v1, &v2)?;
                    Ok((rank, stats.loss.total))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for result in results {
        let (_rank, loss) = result.unwrap();
        assert!(loss.is_finite());
    }
}

/// Single-rank backend that loses its peers during the gradient reduction.
struct DroppedReduce;

impl Collective for DroppedReduce {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, local: &[f32]) -> JemResult<Vec<f32>> {
        Ok(local.to_vec())
    }

    fn all_reduce_sum(&self, _local: &[f32]) -> JemResult<Vec<f32>> {
        Err(pointjem_core::error::context_error("reduction aborted"))
    }
}

#[test]
fn test_backward_collective_failure_is_typed() -> TrainResult<()> {
    let mut cfg = tiny_config(2);
    cfg.loss.gather = true;
    let comm = Communicator::Custom(Arc::new(DroppedReduce));
    let mut trainer = Trainer::with_communicator(cfg, Device::Cpu, comm)?;

    let v1 = Tensor::randn(0f32, 1.0, (4, 16, 3), &Device::Cpu)?;
    let v2 = Tensor::randn(0f32, 1.0, (4, 16, 3), &Device::Cpu)?;
    match trainer.train_step(&v1, &v2) {
        Err(TrainError::Core(JemError::DistributedContext(msg))) => {
            assert!(msg.contains("reduction aborted"))
        }
        other => panic!("expected DistributedContext, got {:?}", other.err()),
    }
    assert_eq!(trainer.global_step, 0);
    Ok(())
}
