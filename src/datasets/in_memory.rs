//! In-memory dataset implementations backed by candle tensors

use super::{Dataset, MetaDataset, Preprocessor};
use crate::error::{Error, Result};
use candle_core::Tensor;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Dataset holding one stacked tensor per class
#[derive(Clone)]
pub struct TensorDataset {
    /// Dataset name
    name: String,
    /// Per-class examples
    data_tensors: Vec<Tensor>,
    /// Optional preprocessing function
    preprocessor: Option<Preprocessor>,
}

impl TensorDataset {
    /// Create a new dataset from per-class tensors
    ///
    /// Every class tensor must have at least one dimension, and all classes
    /// must share the same example shape and dtype.
    pub fn new(name: impl Into<String>, data_tensors: Vec<Tensor>) -> Result<Self> {
        let name = name.into();
        let first = data_tensors
            .first()
            .ok_or_else(|| Error::invalid_input(format!("dataset '{}' has no classes", name)))?;

        if first.rank() == 0 {
            return Err(Error::invalid_input(format!(
                "dataset '{}': class tensors must be shaped [num_examples, ...]",
                name
            )));
        }

        let example_dims = &first.dims()[1..];
        for (k, tensor) in data_tensors.iter().enumerate() {
            if tensor.rank() == 0 || &tensor.dims()[1..] != example_dims {
                return Err(Error::invalid_input(format!(
                    "dataset '{}': class {} has shape {:?}, expected [_, {:?}]",
                    name,
                    k,
                    tensor.dims(),
                    example_dims
                )));
            }
            if tensor.dtype() != first.dtype() {
                return Err(Error::invalid_input(format!(
                    "dataset '{}': class {} has dtype {:?}, expected {:?}",
                    name,
                    k,
                    tensor.dtype(),
                    first.dtype()
                )));
            }
        }

        debug!(
            "Created dataset '{}' with {} classes of example shape {:?}",
            name,
            data_tensors.len(),
            example_dims
        );

        Ok(Self {
            name,
            data_tensors,
            preprocessor: None,
        })
    }

    /// Attach a preprocessing function
    pub fn with_preprocessor(mut self, preprocessor: Preprocessor) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    /// Number of examples stored for a class
    pub fn class_size(&self, class: usize) -> Option<usize> {
        self.data_tensors.get(class).map(|t| t.dims()[0])
    }
}

impl fmt::Debug for TensorDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorDataset")
            .field("name", &self.name)
            .field("num_classes", &self.data_tensors.len())
            .field("has_preprocessor", &self.preprocessor.is_some())
            .finish()
    }
}

impl Dataset for TensorDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn data_tensors(&self) -> &[Tensor] {
        &self.data_tensors
    }

    fn preprocessor(&self) -> Option<Preprocessor> {
        self.preprocessor.clone()
    }
}

/// Meta-dataset holding a fixed batch of datasets
#[derive(Clone)]
pub struct TensorMetaDataset {
    num_classes: usize,
    dataset_batch: Vec<Arc<dyn Dataset>>,
}

impl TensorMetaDataset {
    /// Create a meta-dataset; every dataset must have `num_classes` classes
    pub fn new(num_classes: usize, dataset_batch: Vec<Arc<dyn Dataset>>) -> Result<Self> {
        if num_classes == 0 {
            return Err(Error::invalid_input("num_classes must be > 0"));
        }
        for dataset in &dataset_batch {
            if dataset.num_classes() != num_classes {
                return Err(Error::invalid_input(format!(
                    "dataset '{}' has {} classes, expected {}",
                    dataset.name(),
                    dataset.num_classes(),
                    num_classes
                )));
            }
        }
        Ok(Self {
            num_classes,
            dataset_batch,
        })
    }
}

impl MetaDataset for TensorMetaDataset {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn dataset_batch(&self) -> &[Arc<dyn Dataset>] {
        &self.dataset_batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn class_tensor(n: usize, dim: usize) -> Tensor {
        Tensor::zeros((n, dim), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_dataset_creation() {
        let dataset =
            TensorDataset::new("toy", vec![class_tensor(3, 2), class_tensor(5, 2)]).unwrap();
        assert_eq!(dataset.name(), "toy");
        assert_eq!(dataset.num_classes(), 2);
        assert_eq!(dataset.class_size(1), Some(5));
        assert!(dataset.preprocessor().is_none());
    }

    #[test]
    fn test_dataset_rejects_mismatched_shapes() {
        assert!(TensorDataset::new("empty", vec![]).is_err());
        let result = TensorDataset::new("bad", vec![class_tensor(3, 2), class_tensor(3, 4)]);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_meta_dataset_checks_class_count() {
        let two: Arc<dyn Dataset> = Arc::new(
            TensorDataset::new("two", vec![class_tensor(2, 1), class_tensor(2, 1)]).unwrap(),
        );
        let one: Arc<dyn Dataset> =
            Arc::new(TensorDataset::new("one", vec![class_tensor(2, 1)]).unwrap());

        let meta = TensorMetaDataset::new(2, vec![two.clone(), two.clone()]).unwrap();
        assert_eq!(meta.batch_size(), 2);
        assert_eq!(meta.num_classes(), 2);

        assert!(TensorMetaDataset::new(2, vec![two, one]).is_err());
    }
}
