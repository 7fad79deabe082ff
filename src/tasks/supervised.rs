//! Supervised tasks and task distributions
//!
//! A [`SupervisedTask`] splits every class pool of its dataset into a prefix
//! of `num_query_shots` query examples and the remaining support pool. Query
//! and support labels are synthetic: class `k` of the dataset gets label `k`.
//!
//! The full support pool is unlabeled. The labeled support set is a subset of
//! it, selected through the task's `support_labeled_ids` placeholder, which is
//! bound per evaluation via [`SupervisedTask::get_feed_list`].
//!
//! Preprocessing can be expensive (decoding, resizing, perturbations) and the
//! support pool can be large, so only the query set is preprocessed eagerly.
//! The labeled subset is preprocessed per evaluation and the full support
//! pool only on first access to [`SupervisedTask::unlabeled_support_inputs`].

use candle_core::Tensor;
use once_cell::sync::OnceCell;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::{FeedList, Placeholder, Task, TaskDistribution};
use crate::datasets::{Dataset, MetaDataset, Preprocessor};
use crate::error::{Error, Result};
use crate::samplers::Sampler;

/// Default number of worker lanes used for preprocessing
pub const DEFAULT_PARALLEL_ITERATIONS: usize = 16;

/// Preprocessing workers, shared by every task holding a clone
///
/// Threads start on the first preprocessing call, so tasks over datasets
/// without a preprocessor never spawn any.
#[derive(Clone)]
pub struct PreprocessingPool {
    num_threads: usize,
    pool: Arc<OnceCell<ThreadPool>>,
}

impl PreprocessingPool {
    /// Pool of at most `num_threads` workers
    pub fn new(num_threads: usize) -> Self {
        Self {
            num_threads: num_threads.max(1),
            pool: Arc::new(OnceCell::new()),
        }
    }

    /// Number of worker lanes
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Whether the worker threads have been spawned
    pub fn is_started(&self) -> bool {
        self.pool.get().is_some()
    }

    fn get(&self) -> Result<&ThreadPool> {
        self.pool.get_or_try_init(|| {
            debug!("Starting {} preprocessing threads", self.num_threads);
            ThreadPoolBuilder::new()
                .num_threads(self.num_threads)
                .thread_name(|i| format!("metablocks-preprocess-{}", i))
                .build()
                .map_err(|e| Error::Other(e.into()))
        })
    }
}

impl Default for PreprocessingPool {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLEL_ITERATIONS)
    }
}

impl fmt::Debug for PreprocessingPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreprocessingPool")
            .field("num_threads", &self.num_threads)
            .field("started", &self.is_started())
            .finish()
    }
}

/// A task for supervised meta-learning
pub struct SupervisedTask {
    name: String,
    dataset: Arc<dyn Dataset>,
    num_query_shots: usize,
    pool: PreprocessingPool,
    state: Option<BuiltTask>,
}

/// Internals created by `build`
struct BuiltTask {
    preprocessor: Option<Preprocessor>,
    pool: PreprocessingPool,
    support_labeled_ids: Placeholder,
    query_tensors: (Tensor, Tensor),
    support_inputs_raw: Tensor,
    support_labels_raw: Tensor,
    /// Full support pool after preprocessing, computed on first read
    support_tensors_full: OnceCell<(Tensor, Tensor)>,
}

impl SupervisedTask {
    /// Create an unbuilt task over `dataset`
    pub fn new(
        dataset: Arc<dyn Dataset>,
        num_query_shots: usize,
        name: Option<String>,
    ) -> Self {
        Self {
            name: name.unwrap_or_else(|| "SupervisedTask".to_string()),
            dataset,
            num_query_shots,
            pool: PreprocessingPool::default(),
            state: None,
        }
    }

    /// Set the number of worker lanes used for preprocessing
    pub fn with_parallel_iterations(self, parallel_iterations: usize) -> Self {
        self.with_pool(PreprocessingPool::new(parallel_iterations))
    }

    /// Preprocess on a pool shared with other tasks
    pub fn with_pool(mut self, pool: PreprocessingPool) -> Self {
        self.pool = pool;
        self
    }

    /// Pool used for preprocessing
    pub fn preprocessing_pool(&self) -> &PreprocessingPool {
        &self.pool
    }

    /// Underlying dataset
    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    /// Number of classes
    pub fn num_classes(&self) -> usize {
        self.dataset.num_classes()
    }

    fn built(&self) -> Result<&BuiltTask> {
        self.state
            .as_ref()
            .ok_or_else(|| Error::not_built(self.name.as_str()))
    }

    // --- Properties. ---

    /// Placeholder of the labeled support ids
    pub fn support_labeled_ids(&self) -> Result<&Placeholder> {
        Ok(&self.built()?.support_labeled_ids)
    }

    /// Size of the labeled support set under the given bindings
    pub fn support_size(&self, feeds: &FeedList) -> Result<usize> {
        let state = self.built()?;
        Ok(Self::fed_ids(state, feeds)?.elem_count())
    }

    /// Size of the full unlabeled support pool
    pub fn unlabeled_support_size(&self) -> Result<usize> {
        Ok(self.built()?.support_inputs_raw.dim(0)?)
    }

    /// Preprocessed labeled support `(inputs, labels)` under the given bindings
    pub fn support_tensors(&self, feeds: &FeedList) -> Result<(Tensor, Tensor)> {
        let state = self.built()?;
        let (inputs, labels) = self.gather_support(state, feeds)?;
        preprocess(state, inputs, labels)
    }

    /// Raw labeled support `(inputs, labels)` under the given bindings
    pub fn support_tensors_raw(&self, feeds: &FeedList) -> Result<(Tensor, Tensor)> {
        let state = self.built()?;
        self.gather_support(state, feeds)
    }

    /// Preprocessed query `(inputs, labels)`
    pub fn query_tensors(&self) -> Result<(Tensor, Tensor)> {
        Ok(self.built()?.query_tensors.clone())
    }

    /// All support inputs, preprocessed. Computed once, on first call.
    pub fn unlabeled_support_inputs(&self) -> Result<Tensor> {
        Ok(self.full_support()?.0.clone())
    }

    /// Labels of the full support pool, aligned with [`Self::unlabeled_support_inputs`]
    pub fn unlabeled_support_labels(&self) -> Result<Tensor> {
        Ok(self.full_support()?.1.clone())
    }

    /// All support inputs as stored in the dataset
    pub fn unlabeled_support_inputs_raw(&self) -> Result<Tensor> {
        Ok(self.built()?.support_inputs_raw.clone())
    }

    /// Labels of the raw support pool
    pub fn unlabeled_support_labels_raw(&self) -> Result<Tensor> {
        Ok(self.built()?.support_labels_raw.clone())
    }

    /// Whether the full support pool has been preprocessed
    pub fn has_preprocessed_full_support(&self) -> bool {
        self.state
            .as_ref()
            .map(|state| state.support_tensors_full.get().is_some())
            .unwrap_or(false)
    }

    // --- Auxiliary methods. ---

    fn full_support(&self) -> Result<&(Tensor, Tensor)> {
        let state = self.built()?;
        state.support_tensors_full.get_or_try_init(|| {
            debug!(
                "{}: preprocessing full support pool of {} examples",
                self.name,
                state.support_inputs_raw.dim(0)?
            );
            preprocess(
                state,
                state.support_inputs_raw.clone(),
                state.support_labels_raw.clone(),
            )
        })
    }

    fn fed_ids<'a>(state: &BuiltTask, feeds: &'a FeedList) -> Result<&'a Tensor> {
        feeds
            .get(&state.support_labeled_ids)
            .ok_or_else(|| Error::UnfedPlaceholder(state.support_labeled_ids.to_string()))
    }

    /// Gathers rows of the raw support pool at the fed ids
    fn gather_support(&self, state: &BuiltTask, feeds: &FeedList) -> Result<(Tensor, Tensor)> {
        let ids = Self::fed_ids(state, feeds)?;
        let size = state.support_inputs_raw.dim(0)?;
        for id in ids.to_vec1::<u32>()? {
            if id as usize >= size {
                return Err(Error::IndexOutOfBounds {
                    index: id as usize,
                    size,
                });
            }
        }
        let inputs = state.support_inputs_raw.index_select(ids, 0)?;
        let labels = state.support_labels_raw.index_select(ids, 0)?;
        Ok((inputs, labels))
    }

    /// Slices every class tensor to `[start, end)` and concatenates the slices
    /// with synthetic labels given by class position
    fn get_inputs_and_labels(&self, start: usize, end: Option<usize>) -> Result<(Tensor, Tensor)> {
        let data_tensors = self.dataset.data_tensors();
        let mut inputs = Vec::with_capacity(data_tensors.len());
        let mut labels = Vec::with_capacity(data_tensors.len());

        for (k, x) in data_tensors.iter().enumerate() {
            let n = x.dim(0)?;
            let lo = start.min(n);
            let hi = end.unwrap_or(n).min(n).max(lo);
            if end.is_some_and(|e| e > n) {
                warn!(
                    "{}: class {} has only {} examples, fewer than {} requested",
                    self.name,
                    k,
                    n,
                    end.unwrap_or(n)
                );
            }
            inputs.push(x.narrow(0, lo, hi - lo)?);
            labels.push(Tensor::full(k as u32, hi - lo, x.device())?);
        }

        let inputs = Tensor::cat(&inputs, 0)?;
        let labels = Tensor::cat(&labels, 0)?;
        Ok((inputs, labels))
    }
}

/// Maps the preprocessor over examples on the task's pool, keeping order.
/// Outputs are detached: no gradient flows back through preprocessing.
fn preprocess(state: &BuiltTask, inputs: Tensor, labels: Tensor) -> Result<(Tensor, Tensor)> {
    let preprocessor = match &state.preprocessor {
        Some(preprocessor) => preprocessor,
        None => return Ok((inputs, labels)),
    };

    let num_examples = inputs.dim(0)?;
    if num_examples == 0 {
        return Ok((inputs, labels));
    }

    let label_values = labels.to_vec1::<u32>()?;
    let processed = state.pool.get()?.install(|| {
        (0..num_examples)
            .into_par_iter()
            .map(|i| (**preprocessor)(&inputs.get(i)?, label_values[i]))
            .collect::<Result<Vec<Tensor>>>()
    })?;

    let inputs = Tensor::stack(&processed, 0)?.detach();
    Ok((inputs, labels))
}

impl Task for SupervisedTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_query_shots(&self) -> usize {
        self.num_query_shots
    }

    fn is_built(&self) -> bool {
        self.state.is_some()
    }

    #[instrument(skip(self), fields(task = %self.name))]
    fn build(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::already_built(self.name.as_str()));
        }

        // Input preprocessor.
        let preprocessor = self.dataset.preprocessor();

        // Selector of the labeled support subset, fed per evaluation.
        let support_labeled_ids = Placeholder::new("support_labeled_ids");

        // Query set: the first `num_query_shots` examples of every class.
        let end_index = self.num_query_shots;
        let (query_inputs, query_labels) = self.get_inputs_and_labels(0, Some(end_index))?;

        // Support pool: everything else. Not preprocessed here.
        let (support_inputs_raw, support_labels_raw) =
            self.get_inputs_and_labels(end_index, None)?;

        let mut state = BuiltTask {
            preprocessor,
            pool: self.pool.clone(),
            support_labeled_ids,
            query_tensors: (query_inputs.clone(), query_labels.clone()),
            support_inputs_raw,
            support_labels_raw,
            support_tensors_full: OnceCell::new(),
        };
        state.query_tensors = preprocess(&state, query_inputs, query_labels)?;

        debug!(
            "{}: built with {} query and {} support examples over {} classes",
            self.name,
            state.query_tensors.1.dim(0)?,
            state.support_inputs_raw.dim(0)?,
            self.num_classes()
        );
        self.state = Some(state);
        Ok(())
    }

    fn get_feed_list(&self, support_labeled_ids: &[u32]) -> Result<FeedList> {
        let state = self.built()?;
        let ids = Tensor::new(support_labeled_ids, state.support_inputs_raw.device())?;
        let mut feeds = FeedList::new();
        feeds.push(state.support_labeled_ids.clone(), ids);
        Ok(feeds)
    }
}

impl fmt::Debug for SupervisedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisedTask")
            .field("name", &self.name)
            .field("dataset", &self.dataset.name())
            .field("num_query_shots", &self.num_query_shots)
            .field("built", &self.state.is_some())
            .finish()
    }
}

/// Arguments of one label request, as passed to the sampler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionKwargs {
    /// New labels requested per task
    pub size: usize,
}

/// Ids returned by the sampler for one task in one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRequest {
    /// Position of the request within the episode
    pub round: usize,
    /// Task position in the meta-batch
    pub task_index: usize,
    /// Newly labeled support ids
    pub ids: Vec<u32>,
}

/// Distribution over supervised tasks built from a meta-dataset
pub struct SupervisedTaskDistribution {
    name: String,
    meta_dataset: Arc<dyn MetaDataset>,
    num_classes: usize,
    num_query_shots: usize,
    num_support_shots: usize,
    pool: PreprocessingPool,
    rng: StdRng,
    task_batch: Option<Vec<SupervisedTask>>,

    // Episode state, reset by `initialize`.
    sampler: Option<Box<dyn Sampler>>,
    num_requested_labels: usize,
    requests: Vec<LabelRequest>,
    requested_ids: Vec<Vec<u32>>,
    requested_kwargs: Vec<SelectionKwargs>,
}

impl SupervisedTaskDistribution {
    /// Create an unbuilt distribution
    pub fn new(
        meta_dataset: Arc<dyn MetaDataset>,
        num_query_shots: usize,
        num_support_shots: usize,
        name: Option<String>,
        seed: u64,
    ) -> Self {
        let num_classes = meta_dataset.num_classes();
        Self {
            name: name.unwrap_or_else(|| "SupervisedTaskDistribution".to_string()),
            meta_dataset,
            num_classes,
            num_query_shots,
            num_support_shots,
            pool: PreprocessingPool::default(),
            rng: StdRng::seed_from_u64(seed),
            task_batch: None,
            sampler: None,
            num_requested_labels: 0,
            requests: Vec::new(),
            requested_ids: Vec::new(),
            requested_kwargs: Vec::new(),
        }
    }

    /// Set the preprocessing lanes shared by the tasks built afterwards
    pub fn with_parallel_iterations(mut self, parallel_iterations: usize) -> Self {
        self.pool = PreprocessingPool::new(parallel_iterations);
        self
    }

    /// Pool shared by every task of the batch
    pub fn preprocessing_pool(&self) -> &PreprocessingPool {
        &self.pool
    }

    // --- Properties. ---

    /// Labeled support examples per class
    pub fn num_support_shots(&self) -> usize {
        self.num_support_shots
    }

    /// Query labels spent per task
    pub fn query_labels_per_task(&self) -> usize {
        self.num_classes * self.num_query_shots
    }

    /// Support labels granted per task
    pub fn support_labels_per_task(&self) -> usize {
        self.num_classes * self.num_support_shots
    }

    /// Bound sampler, if initialized
    pub fn sampler(&self) -> Option<&dyn Sampler> {
        self.sampler.as_deref()
    }

    /// Labels requested so far in this episode
    pub fn num_requested_labels(&self) -> usize {
        self.num_requested_labels
    }

    /// Request log of this episode, in request order
    pub fn requests(&self) -> &[LabelRequest] {
        &self.requests
    }

    /// Cumulative labeled ids of a task in this episode
    pub fn requested_ids(&self, task_index: usize) -> &[u32] {
        self.requested_ids
            .get(task_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Arguments of every request made in this episode
    pub fn requested_kwargs(&self) -> &[SelectionKwargs] {
        &self.requested_kwargs
    }

    /// Task at a meta-batch position
    pub fn task(&self, index: usize) -> Result<&SupervisedTask> {
        let batch = self.task_batch()?;
        batch.get(index).ok_or_else(|| {
            Error::invalid_input(format!(
                "task index {} out of range for a meta-batch of {}",
                index,
                batch.len()
            ))
        })
    }

    // --- Methods. ---

    /// Bind a sampler and reset all episode state
    #[instrument(skip(self, sampler), fields(distribution = %self.name))]
    pub fn initialize(&mut self, sampler: Box<dyn Sampler>) {
        debug!("{}: initializing with sampler '{}'", self.name, sampler.name());
        self.sampler = Some(sampler);

        // Reset.
        self.requests.clear();
        self.requested_ids = vec![Vec::new(); self.meta_dataset.batch_size()];
        self.requested_kwargs.clear();
        self.num_requested_labels = 0;
    }

    /// Request `labels_per_task` new labeled support ids for every task
    ///
    /// Ids already requested in this episode are passed to the sampler as
    /// excluded and dropped if returned again. Returns the feed list binding
    /// every task to its cumulative labeled ids.
    #[instrument(skip(self), fields(distribution = %self.name))]
    pub fn request_labels(&mut self, labels_per_task: usize) -> Result<FeedList> {
        let tasks = self
            .task_batch
            .as_ref()
            .ok_or_else(|| Error::not_built(self.name.as_str()))?;
        let sampler = self
            .sampler
            .as_mut()
            .ok_or_else(|| Error::not_initialized(self.name.as_str()))?;

        let kwargs = SelectionKwargs {
            size: labels_per_task,
        };
        let round = self.requested_kwargs.len();
        self.requested_ids.resize(tasks.len(), Vec::new());

        for (task_index, task) in tasks.iter().enumerate() {
            let already = &self.requested_ids[task_index];
            let mut ids = sampler.select_labeled(task, &kwargs, already, &mut self.rng)?;
            let mut seen = HashSet::with_capacity(ids.len());
            ids.retain(|id| !already.contains(id) && seen.insert(*id));

            if ids.len() < labels_per_task {
                warn!(
                    "{}: sampler returned {} of {} requested labels",
                    task.name(),
                    ids.len(),
                    labels_per_task
                );
            }

            self.num_requested_labels += ids.len();
            self.requested_ids[task_index].extend_from_slice(&ids);
            self.requests.push(LabelRequest {
                round,
                task_index,
                ids,
            });
        }
        self.requested_kwargs.push(kwargs);

        info!(
            "{}: request {} done, {} labels requested this episode",
            self.name, round, self.num_requested_labels
        );
        self.current_feed_list()
    }

    /// Feed list for the current episode
    ///
    /// Spends the support label budget on the first call of an episode;
    /// later calls reuse the labels requested so far.
    pub fn sample_task_feed(&mut self) -> Result<FeedList> {
        if self.requested_kwargs.is_empty() {
            let budget = self.support_labels_per_task();
            self.request_labels(budget)
        } else {
            self.current_feed_list()
        }
    }

    /// Feed list binding every task to its cumulative labeled ids
    pub fn current_feed_list(&self) -> Result<FeedList> {
        let mut feeds = FeedList::new();
        for (task_index, task) in self.task_batch()?.iter().enumerate() {
            feeds.extend(task.get_feed_list(self.requested_ids(task_index))?);
        }
        Ok(feeds)
    }

    /// Feed list for explicit per-task labeled ids
    pub fn get_feed_list(&self, support_labeled_ids: &[Vec<u32>]) -> Result<FeedList> {
        let tasks = self.task_batch()?;
        if support_labeled_ids.len() != tasks.len() {
            return Err(Error::invalid_input(format!(
                "expected labeled ids for {} tasks, got {}",
                tasks.len(),
                support_labeled_ids.len()
            )));
        }
        let mut feeds = FeedList::new();
        for (task, ids) in tasks.iter().zip(support_labeled_ids) {
            feeds.extend(task.get_feed_list(ids)?);
        }
        Ok(feeds)
    }
}

impl TaskDistribution for SupervisedTaskDistribution {
    type Task = SupervisedTask;

    fn name(&self) -> &str {
        &self.name
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn num_query_shots(&self) -> usize {
        self.num_query_shots
    }

    #[instrument(skip(self), fields(distribution = %self.name))]
    fn build(&mut self) -> Result<()> {
        if self.task_batch.is_some() {
            return Err(Error::already_built(self.name.as_str()));
        }

        let mut task_batch = Vec::with_capacity(self.meta_dataset.batch_size());
        for (i, dataset) in self.meta_dataset.dataset_batch().iter().enumerate() {
            let mut task = SupervisedTask::new(
                Arc::clone(dataset),
                self.num_query_shots,
                Some(format!("SupervisedTask{}", i)),
            )
            .with_pool(self.pool.clone());
            task.build()?;
            task_batch.push(task);
        }

        info!(
            "{}: built {} tasks ({}-way, {} query / {} support shots)",
            self.name,
            task_batch.len(),
            self.num_classes,
            self.num_query_shots,
            self.num_support_shots
        );
        self.task_batch = Some(task_batch);
        Ok(())
    }

    fn task_batch(&self) -> Result<&[SupervisedTask]> {
        self.task_batch
            .as_deref()
            .ok_or_else(|| Error::not_built(self.name.as_str()))
    }
}
