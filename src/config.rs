//! Configuration structures for meta-learning episodes and adaptation

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration for an episode pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// Task sampling configuration
    pub task: TaskConfig,
    /// Inner-loop adaptation configuration
    pub adaptation: AdaptationConfig,
}

impl MetaConfig {
    /// Load configuration from a JSON or YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.task.validate()?;
        self.adaptation.validate()
    }
}

/// Task and task-distribution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Number of classes per task (N-way)
    pub num_classes: usize,
    /// Query examples taken per class
    pub num_query_shots: usize,
    /// Labeled support examples requested per class
    pub num_support_shots: usize,
    /// Tasks per meta-batch
    pub meta_batch_size: usize,
    /// Seed of the distribution's random generator
    pub seed: u64,
    /// Worker lanes of the preprocessing pool shared by a distribution's tasks
    pub parallel_iterations: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            num_classes: 5,
            num_query_shots: 1,
            num_support_shots: 1,
            meta_batch_size: 4,
            seed: 42,
            parallel_iterations: 16,
        }
    }
}

impl TaskConfig {
    fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::config("num_classes must be > 0"));
        }
        if self.num_query_shots == 0 {
            return Err(Error::config("num_query_shots must be > 0"));
        }
        if self.num_support_shots == 0 {
            return Err(Error::config("num_support_shots must be > 0"));
        }
        if self.meta_batch_size == 0 {
            return Err(Error::config("meta_batch_size must be > 0"));
        }
        if self.parallel_iterations == 0 {
            return Err(Error::config("parallel_iterations must be > 0"));
        }
        Ok(())
    }
}

/// Inner-loop adaptation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationConfig {
    /// Step size of the inner-loop update rule
    pub inner_learning_rate: f64,
    /// L2 weight decay folded into the inner-loop gradient
    pub weight_decay: f64,
    /// Number of inner-loop steps per episode
    pub num_inner_steps: usize,
    /// Detach inner-loop gradients (first-order approximation)
    pub first_order: bool,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            inner_learning_rate: 0.01,
            weight_decay: 0.0,
            num_inner_steps: 1,
            first_order: false,
        }
    }
}

impl AdaptationConfig {
    fn validate(&self) -> Result<()> {
        if !self.inner_learning_rate.is_finite() || self.inner_learning_rate <= 0.0 {
            return Err(Error::config("inner_learning_rate must be finite and > 0"));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(Error::config("weight_decay must be finite and >= 0"));
        }
        if self.num_inner_steps == 0 {
            return Err(Error::config("num_inner_steps must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = MetaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.task.num_query_shots, 1);
        assert_eq!(config.task.seed, 42);
        assert!(!config.adaptation.first_order);
    }

    #[test]
    fn test_rejects_zero_counts() {
        let mut config = MetaConfig::default();
        config.task.num_classes = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = MetaConfig::default();
        config.adaptation.inner_learning_rate = 0.0;
        assert!(config.validate().is_err());

        let mut config = MetaConfig::default();
        config.adaptation.weight_decay = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file_with_partial_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.json");
        fs::write(
            &path,
            r#"{"task": {"num_classes": 3, "num_support_shots": 2}, "adaptation": {"first_order": true}}"#,
        )
        .unwrap();

        let config = MetaConfig::from_file(&path).unwrap();
        assert_eq!(config.task.num_classes, 3);
        assert_eq!(config.task.num_support_shots, 2);
        assert_eq!(config.task.num_query_shots, 1);
        assert!(config.adaptation.first_order);
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.yaml");
        fs::write(
            &path,
            "task:\n  meta_batch_size: 8\nadaptation:\n  inner_learning_rate: 0.5\n  num_inner_steps: 3\n",
        )
        .unwrap();

        let config = MetaConfig::from_file(&path).unwrap();
        assert_eq!(config.task.meta_batch_size, 8);
        assert_eq!(config.adaptation.inner_learning_rate, 0.5);
        assert_eq!(config.adaptation.num_inner_steps, 3);
    }

    #[test]
    fn test_from_file_validates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{"adaptation": {"num_inner_steps": 0}}"#).unwrap();
        assert!(matches!(MetaConfig::from_file(&path), Err(Error::Config(_))));
    }
}
