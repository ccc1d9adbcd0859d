//! Error type shared by the numeric routines of this crate.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Fewer observations than the routine can work with
    #[error("not enough samples: need at least {needed}, got {got}")]
    NotEnoughSamples { needed: usize, got: usize },

    /// Input dimensions that do not line up
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A decomposition that nalgebra refused to produce
    #[error("decomposition failed in {0}")]
    Decomposition(&'static str),

    /// Nested thread pool could not be built
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
