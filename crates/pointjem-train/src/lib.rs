//! Self-supervised point-cloud pretraining with the PointJEM loss.
//!
//! A PointNet-style backbone and a configurable projector embed two augmented
//! views of every cloud; `pointjem_core::JemLoss` turns the pair of embedding
//! batches into the joint-entropy objective that AdamW minimizes.

pub mod backbone;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod model;
pub mod projector;
pub mod schedule;
pub mod train;

pub use config::TrainConfig;
pub use error::{TrainError, TrainResult};
pub use train::{StepStats, Trainer};
