//! # PointJEM loss engine
//!
//! Self-supervised objective for point-cloud encoders: two augmented views are
//! pushed towards a shared, block-quantized joint code.
//!
//! - **Soft block coding**: temperature softmax inside contiguous blocks of
//!   `bin_size` dimensions, floored at `eps`
//! - **Joint entropy**: `sum p log p` over the diagonal of the batch joint
//!   distribution and over its off-block-diagonal blocks
//! - **Transform invariance**: per-sample agreement of the two views' codes
//! - **Full gather**: all-gather forward with a sum-reduce-and-slice backward
//!   so the joint distribution can see every rank's batch
//!
//! ```rust,no_run
//! use candle_core::{DType, Device, Tensor};
//! use pointjem_core::{JemLoss, LossConfig};
//!
//! # fn main() -> pointjem_core::JemResult<()> {
//! let device = Device::Cpu;
//! let config = LossConfig { bin_size: 4, ..LossConfig::default() };
//! let engine = JemLoss::new(config, 8, &device)?;
//!
//! let z1 = Tensor::randn(0f32, 1.0, (16, 8), &device)?;
//! let z2 = Tensor::randn(0f32, 1.0, (16, 8), &device)?;
//! let out = engine.compute_loss(&z1, &z2)?;
//! println!("{:?}", out.components()?);
//! # Ok(())
//! # }
//! ```

pub mod coding;
pub mod comm;
pub mod config;
pub mod error;
pub mod gather;
pub mod invariance;
pub mod joint;
pub mod loss;
mod numerics;
pub mod partition;

pub use coding::SoftBlockEncoder;
pub use comm::{Collective, Communicator, LocalGroup, LocalPeer};
pub use config::LossConfig;
pub use error::{JemError, JemResult};
pub use gather::FullGather;
pub use invariance::TransformInvariance;
pub use joint::{joint_distribution, JointEntropy};
pub use loss::{aggregate, JemLoss, LossComponents, LossOutput};
pub use partition::{BlockPartition, OffBlockIndex};
