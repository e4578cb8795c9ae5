//! Batched two-view iterator.

use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::shapes::PointCloudDataset;
use super::views::ViewSampler;

/// Yields `(view1, view2)` batches of shape `(B, P, 3)`.
///
/// Incomplete trailing batches are dropped so every step sees exactly
/// `batch_size` samples.
pub struct ViewLoader<'a> {
    dataset: &'a dyn PointCloudDataset,
    sampler: ViewSampler,
    batch_size: usize,
    indices: Vec<usize>,
    pos: usize,
    rng: StdRng,
    device: Device,
}

impl<'a> ViewLoader<'a> {
    pub fn new(
        dataset: &'a dyn PointCloudDataset,
        sampler: ViewSampler,
        batch_size: usize,
        seed: u64,
        device: &Device,
    ) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");
        let mut rng = StdRng::seed_from_u64(seed);
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        indices.shuffle(&mut rng);
        Self {
            dataset,
            sampler,
            batch_size,
            indices,
            pos: 0,
            rng,
            device: device.clone(),
        }
    }

    /// Full batches per epoch.
    pub fn n_batches(&self) -> usize {
        self.dataset.len() / self.batch_size
    }
}

impl Iterator for ViewLoader<'_> {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + self.batch_size > self.indices.len() {
            return None;
        }

        let end = self.pos + self.batch_size;
        let batch_indices = self.indices[self.pos..end].to_vec();
        self.pos = end;

        let num_points = self.dataset.num_points();
        let mut flat1 = Vec::with_capacity(self.batch_size * num_points * 3);
        let mut flat2 = Vec::with_capacity(self.batch_size * num_points * 3);
        for idx in batch_indices {
            let cloud = self.dataset.get_item(idx);
            let (v1, v2) = self.sampler.two_views(&cloud, &mut self.rng);
            flat1.extend(v1.into_iter().flatten());
            flat2.extend(v2.into_iter().flatten());
        }

        let shape = (self.batch_size, num_points, 3);
        let result = Tensor::from_vec(flat1, shape, &self.device)
            .and_then(|v1| Ok((v1, Tensor::from_vec(flat2, shape, &self.device)?)));
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticShapes;

    #[test]
    fn test_drop_last_batches() {
        let ds = SyntheticShapes::new(10, 16, 1);
        let loader = ViewLoader::new(&ds, ViewSampler::default(), 4, 0, &Device::Cpu);
        assert_eq!(loader.n_batches(), 2);

        let batches: Vec<_> = loader.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 2);
        for (v1, v2) in &batches {
            assert_eq!(v1.dims(), &[4, 16, 3]);
            assert_eq!(v2.dims(), &[4, 16, 3]);
        }
    }

    #[test]
    fn test_dataset_smaller_than_batch_yields_nothing() {
        let ds = SyntheticShapes::new(3, 8, 1);
        let mut loader = ViewLoader::new(&ds, ViewSampler::default(), 4, 0, &Device::Cpu);
        assert!(loader.next().is_none());
    }
}
