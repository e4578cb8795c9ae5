//! Static block layout of the embedding and the off-block-diagonal pair table.

use candle_core::{Device, Tensor};

use crate::error::{config_error, JemResult};

/// Division of `num_features` dimensions into contiguous blocks of `bin_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPartition {
    num_features: usize,
    bin_size: usize,
    num_blocks: usize,
}

impl BlockPartition {
    pub fn new(num_features: usize, bin_size: usize) -> JemResult<Self> {
        if bin_size == 0 || num_features == 0 {
            return Err(config_error(format!(
                "embedding width ({}) and bin_size ({}) must both be > 0",
                num_features, bin_size
            )));
        }
        if num_features % bin_size != 0 {
            return Err(config_error(format!(
                "embedding width ({}) must be divisible by bin_size ({})",
                num_features, bin_size
            )));
        }
        Ok(Self {
            num_features,
            bin_size,
            num_blocks: num_features / bin_size,
        })
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn bin_size(&self) -> usize {
        self.bin_size
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Number of ordered block pairs `(i, j)` with `i != j`.
    pub fn off_block_pairs(&self) -> usize {
        self.num_blocks * (self.num_blocks - 1)
    }
}

/// Every `(i, j)` block pair with `i != j`, row-major.
///
/// `flat` holds `i * num_blocks + j` for each pair so it can index the
/// `(num_blocks * num_blocks, bin_size * bin_size)` view of the joint matrix.
#[derive(Debug, Clone)]
pub struct OffBlockIndex {
    pairs: Vec<(usize, usize)>,
    flat: Tensor,
}

impl OffBlockIndex {
    pub fn new(num_blocks: usize, device: &Device) -> JemResult<Self> {
        let pairs: Vec<(usize, usize)> = (0..num_blocks)
            .flat_map(|i| (0..num_blocks).map(move |j| (i, j)))
            .filter(|(i, j)| i != j)
            .collect();
        let flat: Vec<u32> = pairs
            .iter()
            .map(|&(i, j)| (i * num_blocks + j) as u32)
            .collect();
        let len = flat.len();
        let flat = Tensor::from_vec(flat, len, device)?;
        Ok(Self { pairs, flat })
    }

    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Row indices into the `(num_blocks^2, bin_size^2)` block view.
    pub fn flat(&self) -> &Tensor {
        &self.flat
    }
}
