// src/lib.rs

//! Bounded pool of lazily-opened raster dataset handles.
//!
//! A client that would otherwise hold thousands of open datasets (a mosaic
//! of thousands of tiles, say) holds [`ProxyDataset`] stand-ins instead;
//! only a small, LRU-managed working set is actually open at any instant.
//! The dataset-opening subsystem is supplied by the embedder through the
//! [`DatasetOpener`] trait.

pub mod error;
pub mod owner;
pub mod pool;
pub mod proxy;
pub mod source;
pub mod utils;

pub use error::{PoolError, PoolResult};
pub use pool::{DatasetLease, EntrySnapshot, PoolStats};
pub use proxy::{ProxyDataset, ProxyRasterBand};
pub use source::{
    AccessMode, ColorEntry, ColorTable, DatasetOpener, DatasetSource, Gcp, RasterBandSource,
    RasterDataType,
};

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
