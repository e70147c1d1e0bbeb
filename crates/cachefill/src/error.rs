use std::sync::Arc;

use thiserror::Error;

/// The reason why a cache fill did not produce a value.
///
/// This error is cloned to every caller that waited on the same computation, which is why the
/// factory error is kept behind an [`Arc`]: all of them observe the very same error instance.
#[derive(Debug, Clone, Error)]
pub enum FillError {
    /// An argument was rejected before any coordination started.
    ///
    /// The attached string names the offending parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The factory failed while computing the value.
    ///
    /// The owner of the computation and every caller waiting for the same key receive a clone
    /// of the same [`Arc`].
    #[error("factory failed: {0:#}")]
    Factory(Arc<anyhow::Error>),
    /// The key's bucket was occupied by unrelated keys too many times in a row.
    ///
    /// This usually means the bucket table is too small for the number of concurrently
    /// computed keys.
    #[error("gave up after {attempts} attempts that all collided with unrelated keys")]
    TooManyCollisions {
        /// How many times a claim on the bucket was attempted.
        attempts: usize,
    },
    /// The computation ended without producing an outcome.
    ///
    /// This happens when the factory panics, or when its task is torn down together with the
    /// runtime.
    #[error("computation ended without a result")]
    Abandoned,
}

impl FillError {
    /// Returns the error raised by the factory, if this is a [`Factory`](Self::Factory) error.
    pub fn factory_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Factory(err) => Some(&**err),
            _ => None,
        }
    }

    /// Whether this error was caused by exhausting the collision retries.
    pub fn is_collision(&self) -> bool {
        matches!(self, Self::TooManyCollisions { .. })
    }

    /// A short, static name of the error kind, used to tag metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Factory(_) => "factory",
            Self::TooManyCollisions { .. } => "too_many_collisions",
            Self::Abandoned => "abandoned",
        }
    }
}

/// The outcome of a cache fill.
pub type FillResult<T> = Result<T, FillError>;
