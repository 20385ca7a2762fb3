//! Error types for the transformer pool.

use crate::transformer::TransformerType;

/// Pool construction errors. Raised once, before any transformer exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_concurrent must be at least 1")]
    ZeroConcurrency,
    #[error("staleness interval must be non-zero")]
    ZeroStalenessInterval,
    #[error("cache sweeping requires a running tokio runtime")]
    NoRuntime,
}

/// Errors returned by [`TransformerPool`](crate::TransformerPool) operations.
///
/// Waiting for capacity is not an error: a cancelled `acquire` yields `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to construct transformer for {ty}")]
    Construction {
        ty: TransformerType,
        #[source]
        source: anyhow::Error,
    },
    #[error("At capacity ({max} transformers in use)")]
    AtCapacity { max: usize },
    #[error("Pool is shut down")]
    Closed,
}

impl PoolError {
    pub fn is_construction(&self) -> bool {
        matches!(self, PoolError::Construction { .. })
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
