//! Error types for the meta-blocks system

use thiserror::Error;

/// Main error type for meta-blocks operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Derived state was read before `build()`
    #[error("{0} has not been built yet; call build() first")]
    NotBuilt(String),

    /// `build()` was called on an object that is already built
    #[error("{0} is already built and cannot be rebuilt")]
    AlreadyBuilt(String),

    /// A label request arrived before `initialize()`
    #[error("{0} is not initialized; call initialize() at the start of the episode")]
    NotInitialized(String),

    /// An evaluation needed an external input that was not bound
    #[error("No value was fed for placeholder '{0}'")]
    UnfedPlaceholder(String),

    /// Labeled support id outside of the support pool
    #[error("Index {index} is out of bounds for a support pool of size {size}")]
    IndexOutOfBounds {
        /// Offending index
        index: usize,
        /// Size of the indexed pool
        size: usize,
    },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for meta-blocks operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a not-built sequencing error
    pub fn not_built(what: impl Into<String>) -> Self {
        Self::NotBuilt(what.into())
    }

    /// Create an already-built sequencing error
    pub fn already_built(what: impl Into<String>) -> Self {
        Self::AlreadyBuilt(what.into())
    }

    /// Create a not-initialized sequencing error
    pub fn not_initialized(what: impl Into<String>) -> Self {
        Self::NotInitialized(what.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
