//! Label samplers
//!
//! A sampler decides which support examples of a task get labeled. Task
//! distributions only track what was requested; the selection policy lives
//! behind the [`Sampler`] trait.

use rand::rngs::StdRng;
use rand::seq::index;

use crate::error::Result;
use crate::tasks::{SelectionKwargs, SupervisedTask};

/// Selects support examples to be labeled
pub trait Sampler {
    /// Sampler name
    fn name(&self) -> &str;

    /// Pick up to `kwargs.size` ids from the task's support pool
    ///
    /// `excluded` holds the ids already labeled in this episode; returning
    /// them again has no effect.
    fn select_labeled(
        &mut self,
        task: &SupervisedTask,
        kwargs: &SelectionKwargs,
        excluded: &[u32],
        rng: &mut StdRng,
    ) -> Result<Vec<u32>>;
}

/// Picks support ids uniformly at random, without replacement
#[derive(Debug, Clone, Default)]
pub struct UniformSampler;

impl UniformSampler {
    /// Create a uniform sampler
    pub fn new() -> Self {
        Self
    }
}

impl Sampler for UniformSampler {
    fn name(&self) -> &str {
        "uniform"
    }

    fn select_labeled(
        &mut self,
        task: &SupervisedTask,
        kwargs: &SelectionKwargs,
        excluded: &[u32],
        rng: &mut StdRng,
    ) -> Result<Vec<u32>> {
        let pool_size = task.unlabeled_support_size()?;
        let candidates: Vec<u32> = (0..pool_size as u32)
            .filter(|id| !excluded.contains(id))
            .collect();
        let amount = kwargs.size.min(candidates.len());

        Ok(index::sample(rng, candidates.len(), amount)
            .into_iter()
            .map(|i| candidates[i])
            .collect())
    }
}
