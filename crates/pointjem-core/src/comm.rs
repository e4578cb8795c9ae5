//! Collective communication between ranks.
//!
//! Collectives are blocking and lock-step: every rank must issue the same
//! sequence of calls. Buffers are exchanged and returned in rank order.

use std::sync::{Arc, Barrier, Mutex};

use crate::error::{context_error, JemResult};

/// A blocking collective backend over host `f32` buffers.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Concatenation of every rank's `local` buffer, in rank order.
    fn all_gather(&self, local: &[f32]) -> JemResult<Vec<f32>>;

    /// Elementwise sum of every rank's `local` buffer.
    fn all_reduce_sum(&self, local: &[f32]) -> JemResult<Vec<f32>>;
}

/// Handle to the multi-device context of this process.
#[derive(Clone, Default)]
pub enum Communicator {
    /// No multi-device context; every collective fails.
    #[default]
    None,
    /// One rank of an in-process [`LocalGroup`].
    Local(LocalPeer),
    /// Externally supplied backend.
    Custom(Arc<dyn Collective>),
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Communicator::None => write!(f, "Communicator::None"),
            Communicator::Local(peer) => write!(
                f,
                "Communicator::Local(rank={}, world_size={})",
                peer.rank, peer.world_size
            ),
            Communicator::Custom(c) => write!(
                f,
                "Communicator::Custom(rank={}, world_size={})",
                c.rank(),
                c.world_size()
            ),
        }
    }
}

impl From<LocalPeer> for Communicator {
    fn from(value: LocalPeer) -> Self {
        Self::Local(value)
    }
}

impl Communicator {
    pub fn none() -> Self {
        Self::None
    }

    pub fn is_initialized(&self) -> bool {
        !matches!(self, Communicator::None)
    }

    fn backend(&self) -> JemResult<&dyn Collective> {
        match self {
            Communicator::None => Err(context_error(
                "collective called without an initialized multi-device context",
            )),
            Communicator::Local(peer) => Ok(peer),
            Communicator::Custom(c) => Ok(c.as_ref()),
        }
    }

    pub fn rank(&self) -> JemResult<usize> {
        Ok(self.backend()?.rank())
    }

    pub fn world_size(&self) -> JemResult<usize> {
        Ok(self.backend()?.world_size())
    }

    pub fn all_gather(&self, local: &[f32]) -> JemResult<Vec<f32>> {
        self.backend()?.all_gather(local)
    }

    pub fn all_reduce_sum(&self, local: &[f32]) -> JemResult<Vec<f32>> {
        self.backend()?.all_reduce_sum(local)
    }
}

struct Shared {
    slots: Mutex<Vec<Vec<f32>>>,
    barrier: Barrier,
}

/// Factory for an in-process group of ranks, one per thread.
pub struct LocalGroup;

impl LocalGroup {
    /// One peer per rank, in rank order. Move each into its own thread.
    pub fn new(world_size: usize) -> JemResult<Vec<LocalPeer>> {
        if world_size == 0 {
            return Err(context_error("world_size must be > 0"));
        }
        let shared = Arc::new(Shared {
            slots: Mutex::new(vec![Vec::new(); world_size]),
            barrier: Barrier::new(world_size),
        });
        Ok((0..world_size)
            .map(|rank| LocalPeer {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect())
    }
}

/// One rank of a [`LocalGroup`].
#[derive(Clone)]
pub struct LocalPeer {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl LocalPeer {
    /// Publish `local`, wait for every rank, then combine all slots.
    fn exchange<T>(
        &self,
        local: &[f32],
        combine: impl FnOnce(&[Vec<f32>]) -> JemResult<T>,
    ) -> JemResult<T> {
        {
            let mut slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| context_error("collective state poisoned"))?;
            slots[self.rank] = local.to_vec();
        }
        self.shared.barrier.wait();

        let result = {
            let slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| context_error("collective state poisoned"))?;
            combine(&slots)
        };

        // Nobody may overwrite a slot before every rank has read it.
        self.shared.barrier.wait();
        result
    }
}

fn check_lengths(slots: &[Vec<f32>]) -> JemResult<usize> {
    let len = slots.first().map(Vec::len).unwrap_or(0);
    if let Some((rank, slot)) = slots.iter().enumerate().find(|(_, s)| s.len() != len) {
        return Err(context_error(format!(
            "rank {} contributed {} values, rank 0 contributed {}",
            rank,
            slot.len(),
            len
        )));
    }
    Ok(len)
}

impl Collective for LocalPeer {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, local: &[f32]) -> JemResult<Vec<f32>> {
        self.exchange(local, |slots| {
            check_lengths(slots)?;
            Ok(slots.concat())
        })
    }

    fn all_reduce_sum(&self, local: &[f32]) -> JemResult<Vec<f32>> {
        self.exchange(local, |slots| {
            let len = check_lengths(slots)?;
            let mut out = vec![0.0f32; len];
            for slot in slots {
                for (o, v) in out.iter_mut().zip(slot) {
                    *o += v;
                }
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_group<T: Send>(
        world_size: usize,
        f: impl Fn(LocalPeer) -> T + Sync,
    ) -> Vec<T> {
        let peers = LocalGroup::new(world_size).unwrap();
        thread::scope(|s| {
            let handles: Vec<_> = peers
                .into_iter()
                .map(|peer| {
                    let f = &f;
                    s.spawn(move || f(peer))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_none_fails_fast() {
        let comm = Communicator::none();
        assert!(!comm.is_initialized());
        assert!(comm.rank().unwrap_err().is_distributed());
        assert!(comm.all_gather(&[1.0]).unwrap_err().is_distributed());
        assert!(comm.all_reduce_sum(&[1.0]).is_err());
    }

    #[test]
    fn test_all_gather_in_rank_order() {
        let results = run_group(3, |peer| {
            let rank = peer.rank() as f32;
            peer.all_gather(&[rank, rank + 0.5]).unwrap()
        });
        for out in results {
            assert_eq!(out, vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
        }
    }

    #[test]
    fn test_all_reduce_sum() {
        let results = run_group(2, |peer| {
            let rank = peer.rank() as f32;
            peer.all_reduce_sum(&[1.0 + rank, 10.0 * rank]).unwrap()
        });
        for out in results {
            assert_eq!(out, vec![3.0, 10.0]);
        }
    }

    #[test]
    fn test_repeated_collectives_stay_in_lockstep() {
        let results = run_group(4, |peer| {
            let mut acc = Vec::new();
            for step in 0..10 {
                let v = (peer.rank() * 100 + step) as f32;
                acc.push(peer.all_reduce_sum(&[v]).unwrap()[0]);
            }
            acc
        });
        for out in &results {
            for (step, v) in out.iter().enumerate() {
                assert_eq!(*v, (600 + 4 * step) as f32);
            }
        }
    }

    #[test]
    fn test_mismatched_lengths_rejected_on_every_rank() {
        let results = run_group(2, |peer| {
            let buf = vec![0.0f32; 1 + peer.rank()];
            peer.all_gather(&buf)
        });
        assert!(results.iter().all(|r| r.as_ref().unwrap_err().is_distributed()));
    }

    #[test]
    fn test_zero_world_size() {
        assert!(LocalGroup::new(0).is_err());
    }
}
