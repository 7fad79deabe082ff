//! Tasks (episodes) and task distributions
//!
//! A task turns one dataset into a few-shot episode: a query set that defines
//! the classes, a large unlabeled support pool, and a small labeled support
//! subset chosen at evaluation time. A task distribution builds one task per
//! slot of a meta-batch and keeps track of the labels requested from a
//! [`Sampler`](crate::samplers::Sampler) during an episode.

pub mod feed;
pub mod supervised;

pub use feed::{Feed, FeedList, Placeholder};
pub use supervised::{
    LabelRequest, PreprocessingPool, SelectionKwargs, SupervisedTask, SupervisedTaskDistribution,
};

use crate::error::Result;

/// Common interface of tasks
pub trait Task: Send + Sync {
    /// Task name
    fn name(&self) -> &str;

    /// Query examples taken per class
    fn num_query_shots(&self) -> usize;

    /// Whether `build` has completed
    fn is_built(&self) -> bool;

    /// Build the task internals; must be called exactly once
    fn build(&mut self) -> Result<()>;

    /// Bind the labeled support selector to concrete ids
    fn get_feed_list(&self, support_labeled_ids: &[u32]) -> Result<FeedList>;
}

/// Common interface of task distributions
pub trait TaskDistribution {
    /// Task type produced by the distribution
    type Task: Task;

    /// Distribution name
    fn name(&self) -> &str;

    /// Classes per task
    fn num_classes(&self) -> usize;

    /// Query examples taken per class
    fn num_query_shots(&self) -> usize;

    /// Build the batch of tasks; must be called exactly once
    fn build(&mut self) -> Result<()>;

    /// Built tasks in meta-batch order
    fn task_batch(&self) -> Result<&[Self::Task]>;
}
