//! Meta-Blocks - building blocks for few-shot meta-learning
//!
//! This crate provides tasks (episodes) sampled from meta-datasets, the
//! bookkeeping of label requests across an episode, and the adaptation
//! primitives used by gradient-based and prototype-based meta-learners.
//! Tensors and automatic differentiation come from candle.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod adaptation;
pub mod config;
pub mod datasets;
pub mod error;
pub mod runtime;
pub mod samplers;
pub mod tasks;

// Re-exports
pub use adaptation::{
    build_new_parameters, build_prototypes, make_custom_getter, prototype_logits, CustomGetter,
    InnerOptimizer, ParamMap, Parameter, SgdOptimizer, VariableGetter, VariableSpec,
};
pub use config::{AdaptationConfig, MetaConfig, TaskConfig};
pub use datasets::{Dataset, MetaDataset, Preprocessor, TensorDataset, TensorMetaDataset};
pub use error::{Error, Result};
pub use samplers::{Sampler, UniformSampler};
pub use tasks::{
    FeedList, Placeholder, SupervisedTask, SupervisedTaskDistribution, Task, TaskDistribution,
};
