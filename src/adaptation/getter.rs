//! Parameter lookup for forward passes
//!
//! Model builders ask a [`VariableGetter`] for every parameter they use. The
//! default getter is a [`VarMap`], which creates or fetches the model's
//! persistent variables. A [`CustomGetter`] sits in front of it and answers
//! with substitute tensors (for example, inner-loop adapted parameters) for
//! the names it knows, so a forward pass can run "as if" the parameters were
//! updated without touching the persistent state.

use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::{Init, VarMap};
use std::fmt;

use super::ParamMap;
use crate::error::{Error, Result};

/// Everything a getter needs to create a variable besides its name
#[derive(Debug, Clone)]
pub struct VariableSpec {
    /// Variable shape
    pub shape: Shape,
    /// Initializer used when the variable does not exist yet
    pub init: Init,
    /// Data type
    pub dtype: DType,
    /// Device
    pub device: Device,
}

impl VariableSpec {
    /// Create a variable spec
    pub fn new(shape: impl Into<Shape>, init: Init, dtype: DType, device: &Device) -> Self {
        Self {
            shape: shape.into(),
            init,
            dtype,
            device: device.clone(),
        }
    }
}

/// Resolves parameters by name
pub trait VariableGetter {
    /// Get the tensor for parameter `name`
    fn get_variable(&self, name: &str, spec: &VariableSpec) -> Result<Tensor>;
}

impl VariableGetter for VarMap {
    fn get_variable(&self, name: &str, spec: &VariableSpec) -> Result<Tensor> {
        Ok(self.get(
            spec.shape.clone(),
            name,
            spec.init,
            spec.dtype,
            &spec.device,
        )?)
    }
}

impl VariableGetter for ParamMap {
    fn get_variable(&self, name: &str, _spec: &VariableSpec) -> Result<Tensor> {
        self.get(name)
            .map(|param| param.value().clone())
            .ok_or_else(|| Error::invalid_input(format!("unknown parameter '{}'", name)))
    }
}

/// Substitutes known parameters and delegates everything else
#[derive(Clone)]
pub struct CustomGetter {
    custom_variables: ParamMap,
}

/// Provide a custom getter that replaces the named parameters with the given
/// tensors; other names fall through to the default getter
pub fn make_custom_getter(custom_variables: ParamMap) -> CustomGetter {
    CustomGetter { custom_variables }
}

impl CustomGetter {
    /// Resolve `name`, substituting when a custom tensor is present
    pub fn get(
        &self,
        getter: &dyn VariableGetter,
        name: &str,
        spec: &VariableSpec,
    ) -> Result<Tensor> {
        match self.custom_variables.get(name) {
            Some(variable) => Ok(variable.value().clone()),
            None => getter.get_variable(name, spec),
        }
    }

    /// Bind a default getter, producing a getter for model builders
    pub fn over<'a>(&'a self, default: &'a dyn VariableGetter) -> ScopedGetter<'a> {
        ScopedGetter {
            custom: self,
            default,
        }
    }

    /// Substituted parameters
    pub fn custom_variables(&self) -> &ParamMap {
        &self.custom_variables
    }
}

impl fmt::Debug for CustomGetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomGetter")
            .field("names", &self.custom_variables.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A [`CustomGetter`] bound to its default getter
pub struct ScopedGetter<'a> {
    custom: &'a CustomGetter,
    default: &'a dyn VariableGetter,
}

impl VariableGetter for ScopedGetter<'_> {
    fn get_variable(&self, name: &str, spec: &VariableSpec) -> Result<Tensor> {
        self.custom.get(self.default, name, spec)
    }
}
