// src/error.rs
use thiserror::Error;

/// Result type for pool and proxy operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by the dataset pool and the proxy objects built on it.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every pool entry is currently leased; nothing can be evicted.
    #[error(
        "Too many threads are running for the current value of the dataset pool size ({max_size}), \
         or too many proxy datasets are opened in a cascaded way. \
         Try increasing GDAL_MAX_DATASET_POOL_SIZE."
    )]
    Exhausted { max_size: usize },

    /// The underlying dataset could not be materialized (open failed or the
    /// cached slot holds a dead handle).
    #[error("dataset '{description}' is not available")]
    Unavailable { description: String },

    /// The underlying dataset has no band with the requested number.
    #[error("band {band} is not available in dataset '{description}'")]
    BandMissing { band: usize, description: String },

    /// The operation is advertised but deliberately not implemented.
    #[error("{0}: not implemented")]
    NotImplemented(&'static str),

    /// The underlying dataset reported an error while delegating.
    #[error("dataset '{description}': {source}")]
    Source {
        description: String,
        #[source]
        source: anyhow::Error,
    },
}
