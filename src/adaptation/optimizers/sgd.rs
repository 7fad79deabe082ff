//! Gradient descent update rule with optional weight decay

use candle_core::Tensor;

use super::InnerOptimizer;
use crate::error::Result;

/// Plain gradient descent: `v - lr * (g + weight_decay * v)`
#[derive(Debug, Clone)]
pub struct SgdOptimizer {
    /// Learning rate
    learning_rate: f64,

    /// Weight decay coefficient
    weight_decay: f64,
}

impl SgdOptimizer {
    /// Create a new SGD update rule
    pub fn new(learning_rate: f64, weight_decay: f64) -> Self {
        Self {
            learning_rate,
            weight_decay,
        }
    }

    fn update_parameter(&self, param: &Tensor, grad: &Tensor) -> Result<Tensor> {
        let effective_grad = if self.weight_decay > 0.0 {
            (grad + (param * self.weight_decay)?)?
        } else {
            grad.clone()
        };

        // θ' = θ - α * g
        Ok((param - (effective_grad * self.learning_rate)?)?)
    }
}

impl InnerOptimizer for SgdOptimizer {
    fn name(&self) -> &str {
        "sgd"
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn compute_updates(&self, grads_and_vars: &[(Tensor, Tensor)]) -> Result<Vec<Tensor>> {
        grads_and_vars
            .iter()
            .map(|(grad, var)| self.update_parameter(var, grad))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn vec1(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_sgd_step() {
        let optimizer = SgdOptimizer::new(0.5, 0.0);
        let updates = optimizer
            .compute_updates(&[(vec1(&[2.0, -2.0]), vec1(&[1.0, 1.0]))])
            .unwrap();
        assert_eq!(updates[0].to_vec1::<f32>().unwrap(), vec![0.0, 2.0]);
    }

    #[test]
    fn test_sgd_weight_decay() {
        let optimizer = SgdOptimizer::new(0.1, 0.5);
        // g' = 0 + 0.5 * 2 = 1 ; 2 - 0.1 * 1 = 1.9
        let updates = optimizer
            .compute_updates(&[(vec1(&[0.0]), vec1(&[2.0]))])
            .unwrap();
        let value = updates[0].to_vec1::<f32>().unwrap()[0];
        assert!((value - 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_name_and_learning_rate() {
        let optimizer = SgdOptimizer::new(0.2, 0.01);
        assert_eq!(optimizer.name(), "sgd");
        assert_eq!(optimizer.learning_rate(), 0.2);
    }
}
