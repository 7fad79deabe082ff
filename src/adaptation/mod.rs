//! Adaptation building blocks
//!
//! Gradient-based adaptation computes updated parameters with
//! [`build_new_parameters`] and evaluates the adapted model by handing a
//! [`CustomGetter`] to the forward pass. Metric-based adaptation aggregates
//! support embeddings into class prototypes with [`build_prototypes`].
//!
//! ```rust,ignore
//! let params = parameters_from_var_map(&var_map)?;
//! let support_loss = loss_fn(&model.forward(&var_map, &support_inputs)?, &support_labels)?;
//! let adapted = build_new_parameters(&support_loss, &params, &optimizer, first_order)?;
//!
//! let getter = make_custom_getter(adapted);
//! let query_logits = model.forward(&getter.over(&var_map), &query_inputs)?;
//! ```

pub mod getter;
pub mod optimizers;
pub mod parameters;
pub mod prototypes;

pub use getter::{make_custom_getter, CustomGetter, ScopedGetter, VariableGetter, VariableSpec};
pub use optimizers::{create_optimizer, InnerOptimizer, SgdOptimizer};
pub use parameters::{build_new_parameters, parameters_from_var_map, ParamMap, Parameter};
pub use prototypes::{build_prototypes, prototype_logits};
