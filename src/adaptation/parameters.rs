//! Inner-loop parameter updates

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use std::collections::BTreeMap;
use std::ops::Deref;
use tracing::{debug, instrument};

use super::optimizers::InnerOptimizer;
use crate::error::{Error, Result};

/// Named parameters, ordered by name
pub type ParamMap = BTreeMap<String, Parameter>;

/// A tensor the inner loop can differentiate with respect to
///
/// candle only keeps the gradients of variables after `backward()`. A
/// persistent variable is used as is. Any other tensor is wrapped as
/// `tensor + tap`, where `tap` is a zero variable: the gradient of a loss
/// built from [`value`](Self::value) is read from the tap, while the value
/// still depends on the wrapped tensor so outer gradients flow through it.
#[derive(Debug, Clone)]
pub struct Parameter {
    value: Tensor,
    tap: Option<Var>,
}

impl Parameter {
    /// Wrap a tensor, adding a gradient tap unless it is a variable
    pub fn new(tensor: &Tensor) -> Result<Self> {
        if tensor.is_variable() {
            return Ok(Self {
                value: tensor.clone(),
                tap: None,
            });
        }
        let tap = Var::zeros(tensor.shape(), tensor.dtype(), tensor.device())?;
        let value = tensor.add(tap.as_tensor())?;
        Ok(Self {
            value,
            tap: Some(tap),
        })
    }

    /// The tensor forward passes should read
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// The variable whose gradient is the gradient of [`value`](Self::value)
    pub fn gradient_source(&self) -> &Tensor {
        match &self.tap {
            Some(tap) => tap.as_tensor(),
            None => &self.value,
        }
    }
}

impl From<Var> for Parameter {
    fn from(var: Var) -> Self {
        Self {
            value: var.as_tensor().clone(),
            tap: None,
        }
    }
}

impl Deref for Parameter {
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        &self.value
    }
}

/// Snapshot the persistent variables of a `VarMap` as a parameter mapping
pub fn parameters_from_var_map(var_map: &VarMap) -> Result<ParamMap> {
    let data = var_map
        .data()
        .lock()
        .map_err(|_| Error::Other(anyhow::anyhow!("variable map lock is poisoned")))?;
    Ok(data
        .iter()
        .map(|(name, var)| (name.clone(), Parameter::from(var.clone())))
        .collect())
}

/// Build new parameters by performing one optimization step on `loss`
///
/// The result maps every name of `params` to its updated parameter, ready
/// to be adapted again by another call. Inputs are left untouched; run a
/// forward pass with the result through
/// [`make_custom_getter`](super::make_custom_getter) to evaluate the adapted
/// model. With `first_order`, gradients are detached before the update so
/// that no second-order terms flow through them.
#[instrument(skip_all, fields(num_params = params.len(), first_order = first_order))]
pub fn build_new_parameters(
    loss: &Tensor,
    params: &ParamMap,
    optimizer: &dyn InnerOptimizer,
    first_order: bool,
) -> Result<ParamMap> {
    if params.is_empty() {
        return Err(Error::invalid_input("no parameters to adapt"));
    }

    let (param_names, param_values): (Vec<&String>, Vec<Parameter>) = params
        .iter()
        .map(|(name, param)| (name, param.clone()))
        .unzip();

    let mut grads_and_vars = optimizer.compute_gradients(loss, &param_values)?;
    // Prevent backprop through the gradients, if necessary.
    if first_order {
        grads_and_vars = grads_and_vars
            .into_iter()
            .map(|(grad, var)| (grad.detach(), var))
            .collect();
    }

    let updates = optimizer.compute_updates(&grads_and_vars)?;
    if updates.len() != param_names.len() {
        return Err(Error::Other(anyhow::anyhow!(
            "optimizer '{}' returned {} updates for {} parameters",
            optimizer.name(),
            updates.len(),
            param_names.len()
        )));
    }

    debug!(
        "Updated {} parameters with '{}'",
        updates.len(),
        optimizer.name()
    );
    param_names
        .into_iter()
        .zip(updates)
        .map(|(name, update)| -> Result<(String, Parameter)> {
            Ok((name.clone(), Parameter::new(&update)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptation::optimizers::SgdOptimizer;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device, Var};

    fn params() -> (Var, Var, ParamMap) {
        let w = Var::new(&[1f32, -1.0], &Device::Cpu).unwrap();
        let b = Var::new(&[0.5f32], &Device::Cpu).unwrap();
        let mut params = ParamMap::new();
        params.insert("linear.weight".to_string(), Parameter::from(w.clone()));
        params.insert("linear.bias".to_string(), Parameter::from(b.clone()));
        (w, b, params)
    }

    #[test]
    fn test_keys_are_preserved() {
        let (w, _b, params) = params();
        // The bias does not take part in the loss.
        let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();

        let optimizer = SgdOptimizer::new(0.1, 0.0);
        let updated = build_new_parameters(&loss, &params, &optimizer, false).unwrap();

        assert_eq!(
            updated.keys().collect::<Vec<_>>(),
            params.keys().collect::<Vec<_>>()
        );
        // w - 0.1 * 2w = 0.8w
        let weight = updated["linear.weight"].to_vec1::<f32>().unwrap();
        assert_relative_eq!(weight[0], 0.8, epsilon = 1e-6);
        assert_relative_eq!(weight[1], -0.8, epsilon = 1e-6);
        // Zero gradient leaves the bias unchanged.
        assert_eq!(updated["linear.bias"].to_vec1::<f32>().unwrap(), vec![0.5]);
    }

    #[test]
    fn test_inputs_are_not_mutated() {
        let (w, b, params) = params();
        let loss = (w.as_tensor().sum_all().unwrap() + b.as_tensor().sum_all().unwrap()).unwrap();

        let optimizer = SgdOptimizer::new(1.0, 0.0);
        let updated = build_new_parameters(&loss, &params, &optimizer, true).unwrap();

        assert_eq!(updated["linear.bias"].to_vec1::<f32>().unwrap(), vec![-0.5]);
        assert_eq!(w.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, -1.0]);
        assert_eq!(b.as_tensor().to_vec1::<f32>().unwrap(), vec![0.5]);
    }

    #[test]
    fn test_repeated_steps_keep_adapting() {
        let w = Var::new(&[3f32], &Device::Cpu).unwrap();
        let mut params = ParamMap::new();
        params.insert("w".to_string(), Parameter::from(w));
        let optimizer = SgdOptimizer::new(0.1, 0.0);

        // w' = w - 0.1 * 2w
        let loss = params["w"].sqr().unwrap().sum_all().unwrap();
        let step1 = build_new_parameters(&loss, &params, &optimizer, true).unwrap();
        assert_relative_eq!(step1["w"].to_vec1::<f32>().unwrap()[0], 2.4, epsilon = 1e-6);

        let loss = step1["w"].sqr().unwrap().sum_all().unwrap();
        let pairs = optimizer
            .compute_gradients(&loss, &[step1["w"].clone()])
            .unwrap();
        assert_relative_eq!(pairs[0].0.to_vec1::<f32>().unwrap()[0], 4.8, epsilon = 1e-6);

        let step2 = build_new_parameters(&loss, &step1, &optimizer, true).unwrap();
        assert_relative_eq!(step2["w"].to_vec1::<f32>().unwrap()[0], 1.92, epsilon = 1e-5);
    }

    #[test]
    fn test_plain_tensor_parameters_are_adapted() {
        let mut params = ParamMap::new();
        let value = Tensor::new(&[3f32], &Device::Cpu).unwrap();
        params.insert("w".to_string(), Parameter::new(&value).unwrap());
        assert!(!params["w"].is_variable());

        let loss = params["w"].sqr().unwrap().sum_all().unwrap();
        let optimizer = SgdOptimizer::new(0.1, 0.0);
        let updated = build_new_parameters(&loss, &params, &optimizer, false).unwrap();
        assert_relative_eq!(updated["w"].to_vec1::<f32>().unwrap()[0], 2.4, epsilon = 1e-6);
    }

    #[test]
    fn test_first_order_gradient_reaches_persistent_variable() {
        let w = Var::new(&[3f32], &Device::Cpu).unwrap();
        let mut params = ParamMap::new();
        params.insert("w".to_string(), Parameter::from(w.clone()));

        let inner_loss = params["w"].sqr().unwrap().sum_all().unwrap();
        let optimizer = SgdOptimizer::new(0.1, 0.0);
        let updated = build_new_parameters(&inner_loss, &params, &optimizer, true).unwrap();

        // The tap on the updated value does not cut the path back to w.
        let grads = updated["w"].sum_all().unwrap().backward().unwrap();
        let meta_grad = grads.get(w.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_relative_eq!(meta_grad[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_empty_params_are_rejected() {
        let loss = Tensor::zeros((), DType::F32, &Device::Cpu).unwrap();
        let optimizer = SgdOptimizer::new(0.1, 0.0);
        assert!(matches!(
            build_new_parameters(&loss, &ParamMap::new(), &optimizer, false),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_parameters_from_var_map() {
        let var_map = VarMap::new();
        var_map
            .get((2, 3), "dense.weight", candle_nn::Init::Const(1.0), DType::F32, &Device::Cpu)
            .unwrap();
        var_map
            .get(3, "dense.bias", candle_nn::Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();

        let params = parameters_from_var_map(&var_map).unwrap();
        assert_eq!(
            params.keys().cloned().collect::<Vec<_>>(),
            vec!["dense.bias".to_string(), "dense.weight".to_string()]
        );
        assert_eq!(params["dense.weight"].dims(), &[2, 3]);
    }
}
