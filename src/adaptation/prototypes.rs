//! Prototype aggregation for metric-based classifiers

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// One-hot encode `labels` as `[num_labels, num_classes]` in `dtype`.
/// Labels outside `0..num_classes` encode to an all-zero row.
fn one_hot(labels: &Tensor, num_classes: usize, dtype: DType) -> Result<Tensor> {
    let labels = labels.to_dtype(DType::U32)?;
    let classes = Tensor::arange(0u32, num_classes as u32, labels.device())?;
    Ok(labels
        .unsqueeze(1)?
        .broadcast_eq(&classes.unsqueeze(0)?)?
        .to_dtype(dtype)?)
}

/// Build new prototypes by aggregating embeddings per class
///
/// Returns per-class sums of `embeddings` (`[num_classes, emb_dim]`) and the
/// per-class example counts (`[num_classes]`). Prototypes are not averaged;
/// divide by the counts to get class means, guarding empty classes.
pub fn build_prototypes(
    embeddings: &Tensor,
    labels: &Tensor,
    num_classes: usize,
) -> Result<(Tensor, Tensor)> {
    let (num_inputs, _emb_dim) = embeddings.dims2()?;
    if labels.dims() != [num_inputs] {
        return Err(Error::invalid_input(format!(
            "labels shape {:?} does not match {} embeddings",
            labels.dims(),
            num_inputs
        )));
    }

    // <dtype> [num_inputs, num_classes].
    let labels_onehot = one_hot(labels, num_classes, embeddings.dtype())?;
    // <dtype> [num_classes, emb_dim].
    let prototypes = labels_onehot
        .t()?
        .contiguous()?
        .matmul(&embeddings.contiguous()?)?;
    // <dtype> [num_classes].
    let class_counts = labels_onehot.sum(0)?;
    Ok((prototypes, class_counts))
}

/// Logits of `embeddings` against class prototypes
///
/// Each logit is the negative squared Euclidean distance to the class mean
/// `prototypes[k] / class_counts[k]`. Counts are clamped to at least one, so
/// an empty class sits at the origin instead of producing NaNs.
pub fn prototype_logits(
    embeddings: &Tensor,
    prototypes: &Tensor,
    class_counts: &Tensor,
) -> Result<Tensor> {
    let means = prototypes.broadcast_div(&class_counts.maximum(1.0)?.unsqueeze(1)?)?;

    // <dtype> [num_inputs, 1].
    let embeddings_sq = embeddings.sqr()?.sum_keepdim(1)?;
    // <dtype> [1, num_classes].
    let means_sq = means.sqr()?.sum_keepdim(1)?.t()?;
    // <dtype> [num_inputs, num_classes].
    let cross = embeddings.contiguous()?.matmul(&means.t()?.contiguous()?)?;

    let distances = (embeddings_sq.broadcast_add(&means_sq)? - (cross * 2.0)?)?;
    Ok(distances.neg()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    #[test]
    fn test_prototypes_are_class_sums() {
        let embeddings = Tensor::new(
            &[[1f32, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]],
            &Device::Cpu,
        )
        .unwrap();
        let labels = Tensor::new(&[0u32, 0, 1, 1], &Device::Cpu).unwrap();

        let (prototypes, class_counts) = build_prototypes(&embeddings, &labels, 2).unwrap();
        assert_eq!(
            prototypes.to_vec2::<f32>().unwrap(),
            vec![vec![2.0, 0.0], vec![0.0, 2.0]]
        );
        assert_eq!(class_counts.to_vec1::<f32>().unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_empty_class_yields_zeros() {
        let embeddings = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32, 0], &Device::Cpu).unwrap();

        let (prototypes, class_counts) = build_prototypes(&embeddings, &labels, 2).unwrap();
        assert_eq!(class_counts.to_vec1::<f32>().unwrap(), vec![2.0, 0.0]);
        assert_eq!(
            prototypes.to_vec2::<f32>().unwrap(),
            vec![vec![4.0, 6.0], vec![0.0, 0.0]]
        );
    }

    #[test]
    fn test_out_of_range_labels_are_ignored() {
        let embeddings = Tensor::new(&[[1f32], [5.0]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0i64, 7], &Device::Cpu).unwrap();

        let (prototypes, class_counts) = build_prototypes(&embeddings, &labels, 2).unwrap();
        assert_eq!(prototypes.to_vec2::<f32>().unwrap(), vec![vec![1.0], vec![0.0]]);
        assert_eq!(class_counts.to_vec1::<f32>().unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_mismatched_labels_are_rejected() {
        let embeddings = Tensor::new(&[[1f32], [5.0]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[0u32], &Device::Cpu).unwrap();
        assert!(build_prototypes(&embeddings, &labels, 2).is_err());
    }

    #[test]
    fn test_prototype_logits() {
        let prototypes = Tensor::new(&[[2f32, 0.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let class_counts = Tensor::new(&[2f32, 0.0], &Device::Cpu).unwrap();
        let queries = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();

        let logits = prototype_logits(&queries, &prototypes, &class_counts)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        // Means are [1, 0] and the origin.
        assert_relative_eq!(logits[0][0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(logits[0][1], -1.0, epsilon = 1e-6);
        assert_relative_eq!(logits[1][0], -2.0, epsilon = 1e-6);
        assert_relative_eq!(logits[1][1], -1.0, epsilon = 1e-6);
    }
}
