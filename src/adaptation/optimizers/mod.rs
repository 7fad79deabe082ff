//! Inner-loop update rules
//!
//! Inner-loop optimizers are functional: they turn `(gradient, parameter)`
//! pairs into new parameter tensors and never write to persistent variables.
//! Keeping the update in the computation graph is what lets an outer loop
//! differentiate through adaptation.

pub mod sgd;

pub use sgd::SgdOptimizer;

use candle_core::Tensor;
use tracing::debug;

use super::parameters::Parameter;
use crate::config::AdaptationConfig;
use crate::error::{Error, Result};

/// Trait for inner-loop optimizers
pub trait InnerOptimizer {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Current learning rate
    fn learning_rate(&self) -> f64;

    /// Gradients of a scalar `loss` with respect to each parameter in `vars`
    ///
    /// Returns `(gradient, value)` pairs in the order of `vars`. A parameter
    /// the loss does not depend on gets a zero gradient of its own shape.
    fn compute_gradients(
        &self,
        loss: &Tensor,
        vars: &[Parameter],
    ) -> Result<Vec<(Tensor, Tensor)>> {
        if loss.elem_count() != 1 {
            return Err(Error::invalid_input(format!(
                "loss must be a scalar, got shape {:?}",
                loss.dims()
            )));
        }

        let grads = loss.backward()?;
        vars.iter()
            .enumerate()
            .map(|(i, var)| -> Result<(Tensor, Tensor)> {
                let grad = match grads.get(var.gradient_source()) {
                    Some(grad) => grad.clone(),
                    None => {
                        debug!("loss does not depend on parameter {}, using a zero gradient", i);
                        var.zeros_like()?
                    }
                };
                Ok((grad, var.value().clone()))
            })
            .collect()
    }

    /// One update step per `(gradient, var)` pair, in order
    fn compute_updates(&self, grads_and_vars: &[(Tensor, Tensor)]) -> Result<Vec<Tensor>>;
}

/// Create the inner-loop optimizer described by the configuration
pub fn create_optimizer(config: &AdaptationConfig) -> Box<dyn InnerOptimizer> {
    Box::new(SgdOptimizer::new(
        config.inner_learning_rate,
        config.weight_decay,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{Device, Var};

    #[test]
    fn test_gradients_follow_var_order() {
        let a = Var::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let b = Var::new(&[3f32], &Device::Cpu).unwrap();
        // loss = sum(a^2) + 5 * b
        let loss = (a.as_tensor().sqr().unwrap().sum_all().unwrap()
            + (b.as_tensor() * 5.0).unwrap().sum_all().unwrap())
        .unwrap();

        let optimizer = SgdOptimizer::new(0.1, 0.0);
        let pairs = optimizer
            .compute_gradients(&loss, &[Parameter::from(b), Parameter::from(a)])
            .unwrap();

        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0.to_vec1::<f32>().unwrap(), vec![5.0]);
        assert_eq!(pairs[1].0.to_vec1::<f32>().unwrap(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_unused_parameter_gets_zero_gradient() {
        let used = Var::new(&[1f32, 1.0], &Device::Cpu).unwrap();
        let unused = Var::new(&[4f32, 4.0, 4.0], &Device::Cpu).unwrap();
        let loss = used.as_tensor().sum_all().unwrap();

        let optimizer = SgdOptimizer::new(0.1, 0.0);
        let pairs = optimizer
            .compute_gradients(&loss, &[Parameter::from(unused)])
            .unwrap();
        assert_eq!(pairs[0].0.to_vec1::<f32>().unwrap(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_rejects_non_scalar_loss() {
        let v = Var::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let optimizer = SgdOptimizer::new(0.1, 0.0);
        assert!(optimizer
            .compute_gradients(v.as_tensor(), &[Parameter::from(v.clone())])
            .is_err());
    }

    #[test]
    fn test_create_optimizer_from_config() {
        let config = AdaptationConfig {
            inner_learning_rate: 0.25,
            ..Default::default()
        };
        let optimizer = create_optimizer(&config);
        assert_eq!(optimizer.name(), "sgd");
        assert_relative_eq!(optimizer.learning_rate(), 0.25);
    }

    #[test]
    fn test_tapped_parameter_gets_its_gradient() {
        // A derived tensor, as produced by an earlier inner step.
        let w = Var::new(&[2f32, -1.0], &Device::Cpu).unwrap();
        let derived = (w.as_tensor() * 3.0).unwrap();
        let param = Parameter::new(&derived).unwrap();
        let loss = param.sqr().unwrap().sum_all().unwrap();

        let optimizer = SgdOptimizer::new(0.1, 0.0);
        let pairs = optimizer.compute_gradients(&loss, &[param]).unwrap();
        assert_eq!(pairs[0].0.to_vec1::<f32>().unwrap(), vec![12.0, -6.0]);
        assert_eq!(pairs[0].1.to_vec1::<f32>().unwrap(), vec![6.0, -3.0]);
    }
}
