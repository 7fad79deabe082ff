//! Dataset contracts consumed by tasks
//!
//! A [`Dataset`] is a fixed, ordered collection of per-class example tensors
//! (one stacked tensor per class) together with an optional preprocessing
//! function. A [`MetaDataset`] hands out one such dataset per meta-batch slot.
//! Loading and sampling the underlying categories happens elsewhere; these
//! traits only describe the tensor-batch contract.

use candle_core::Tensor;
use std::sync::Arc;

use crate::error::Result;

pub mod in_memory;

pub use in_memory::{TensorDataset, TensorMetaDataset};

/// Maps one raw example and its label to a processed example
pub type Preprocessor = Arc<dyn Fn(&Tensor, u32) -> Result<Tensor> + Send + Sync>;

/// A collection of per-class example pools
pub trait Dataset: Send + Sync {
    /// Dataset name/identifier
    fn name(&self) -> &str;

    /// Per-class example tensors, each shaped `[num_examples, ...]`
    fn data_tensors(&self) -> &[Tensor];

    /// Preprocessing function, `None` for identity
    fn preprocessor(&self) -> Option<Preprocessor>;

    /// Number of classes
    fn num_classes(&self) -> usize {
        self.data_tensors().len()
    }
}

/// A batch of datasets, one per task in a meta-batch
pub trait MetaDataset: Send + Sync {
    /// Classes in every dataset of the batch
    fn num_classes(&self) -> usize;

    /// Datasets in meta-batch order
    fn dataset_batch(&self) -> &[Arc<dyn Dataset>];

    /// Size of the meta-batch
    fn batch_size(&self) -> usize {
        self.dataset_batch().len()
    }
}
