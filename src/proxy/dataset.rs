// src/proxy/dataset.rs

//! Proxy dataset: a lightweight stand-in for a raster source.
//!
//! A `ProxyDataset` advertises dimensions, projection and band layout
//! without opening anything. Every delegated operation leases the real
//! dataset out of the pool for just the duration of the call, so thousands
//! of proxies can coexist with a small working set of open sources.

use std::ffi::c_void;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{PoolError, PoolResult};
use crate::owner::{self, OwnerId};
use crate::pool::{self, DatasetLease};
use crate::proxy::band::ProxyRasterBand;
use crate::source::{AccessMode, DatasetOpener, DatasetSource, Gcp, RasterDataType};

/// Identity of the proxied source, shared between a proxy dataset and its
/// bands. This is what the pool keys on.
pub(crate) struct ProxyCore {
    description: String,
    access: AccessMode,
    shared: bool,
    owner: OwnerId,
    open_options: Mutex<Option<Vec<String>>>,
    opener: Arc<dyn DatasetOpener>,
}

impl ProxyCore {
    pub(crate) fn description(&self) -> &str {
        &self.description
    }

    /// Lease the underlying dataset, impersonating the owner that created
    /// the proxy. Proxies are routinely created by one thread and used by
    /// others; opens triggered by those other threads must stay attributed
    /// to the creator so the registry above closes auxiliaries correctly.
    /// Returns `None` when the dataset cannot be materialized.
    pub(crate) fn ref_underlying(&self) -> Option<DatasetLease> {
        let options = self.open_options.lock().clone().unwrap_or_default();
        let outcome = {
            let _imp = owner::impersonate(self.owner);
            pool::acquire_dataset(
                &self.description,
                self.access,
                &options,
                self.shared,
                &self.opener,
            )
        };
        match outcome {
            Ok(lease) if lease.dataset().is_some() => Some(lease),
            Ok(lease) => {
                pool::release_dataset(lease);
                None
            }
            // The pool already reported the failure.
            Err(_) => None,
        }
    }

    pub(crate) fn unref_underlying(&self, lease: DatasetLease) {
        pool::release_dataset(lease);
    }

    /// Run `f` against the underlying dataset under a short-lived lease.
    pub(crate) fn with_dataset<R>(&self, f: impl FnOnce(&dyn DatasetSource) -> R) -> Option<R> {
        let lease = self.ref_underlying()?;
        let result = {
            let dataset = lease.dataset().expect("lease verified live");
            f(dataset.as_ref())
        };
        self.unref_underlying(lease);
        Some(result)
    }
}

/// A pooled stand-in for a raster dataset.
///
/// Construction claims the process-wide pool and opens nothing; destruction
/// closes the proxied dataset if it is idle in the pool (unless the proxy is
/// shared) and releases the pool again.
pub struct ProxyDataset {
    core: Arc<ProxyCore>,
    raster_x_size: usize,
    raster_y_size: usize,
    projection_override: Mutex<Option<String>>,
    geo_transform_override: Mutex<Option<[f64; 6]>>,
    bands: Vec<Arc<ProxyRasterBand>>,
}

impl ProxyDataset {
    /// Create a proxy for the dataset named by `description`.
    ///
    /// `projection` and `geo_transform`, when given, are served directly by
    /// the proxy without ever materializing the dataset; when absent the
    /// corresponding accessors delegate. `shared` proxies with the same
    /// description share one pooled dataset per creating thread.
    pub fn new(
        description: &str,
        raster_size: (usize, usize),
        access: AccessMode,
        shared: bool,
        projection: Option<&str>,
        geo_transform: Option<[f64; 6]>,
        opener: Arc<dyn DatasetOpener>,
    ) -> Self {
        pool::claim();
        ProxyDataset {
            core: Arc::new(ProxyCore {
                description: description.to_string(),
                access,
                shared,
                owner: owner::current_owner(),
                open_options: Mutex::new(None),
                opener,
            }),
            raster_x_size: raster_size.0,
            raster_y_size: raster_size.1,
            projection_override: Mutex::new(projection.map(str::to_string)),
            geo_transform_override: Mutex::new(geo_transform),
            bands: Vec::new(),
        }
    }

    pub fn description(&self) -> &str {
        &self.core.description
    }

    pub fn raster_size(&self) -> (usize, usize) {
        (self.raster_x_size, self.raster_y_size)
    }

    pub fn access(&self) -> AccessMode {
        self.core.access
    }

    pub fn is_shared(&self) -> bool {
        self.core.shared
    }

    /// Record the open options forwarded to the opener. One-shot: panics if
    /// options were already set.
    pub fn set_open_options(&self, options: Vec<String>) {
        let mut slot = self.core.open_options.lock();
        assert!(slot.is_none(), "open options can only be set once");
        *slot = Some(options);
    }

    /// Describe the next band without opening anything. Bands are numbered
    /// from 1 in installation order.
    pub fn add_band_description(
        &mut self,
        data_type: RasterDataType,
        block_size: (usize, usize),
    ) -> Arc<ProxyRasterBand> {
        let band = ProxyRasterBand::described(
            Arc::clone(&self.core),
            self.bands.len() + 1,
            data_type,
            (self.raster_x_size, self.raster_y_size),
            block_size,
        );
        self.bands.push(Arc::clone(&band));
        band
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// Band access, 1-based.
    pub fn band(&self, band: usize) -> Option<&Arc<ProxyRasterBand>> {
        self.bands.get(band.checked_sub(1)?)
    }

    pub fn bands(&self) -> &[Arc<ProxyRasterBand>] {
        &self.bands
    }

    /// Lease the underlying dataset. The lease must be returned with
    /// [`unref_underlying`](Self::unref_underlying) once the caller is done
    /// with it; holding leases pins pool entries.
    pub fn ref_underlying(&self) -> Option<DatasetLease> {
        self.core.ref_underlying()
    }

    pub fn unref_underlying(&self, lease: DatasetLease) {
        self.core.unref_underlying(lease);
    }

    /// The projection override when one was supplied at construction,
    /// otherwise the underlying dataset's projection.
    pub fn projection(&self) -> Option<String> {
        if let Some(wkt) = self.projection_override.lock().clone() {
            return Some(wkt);
        }
        self.core.with_dataset(|ds| ds.projection())
    }

    /// Write the projection through to the underlying dataset. Clears the
    /// override: subsequent reads delegate.
    pub fn set_projection(&self, wkt: &str) -> PoolResult<()> {
        *self.projection_override.lock() = None;
        self.delegate_mutation(|ds| ds.set_projection(wkt))
    }

    /// The geotransform override when one was supplied at construction,
    /// otherwise the underlying dataset's geotransform.
    pub fn geo_transform(&self) -> Option<[f64; 6]> {
        if let Some(transform) = *self.geo_transform_override.lock() {
            return Some(transform);
        }
        self.core.with_dataset(|ds| ds.geo_transform()).flatten()
    }

    /// Write the geotransform through to the underlying dataset. Clears the
    /// override: subsequent reads delegate.
    pub fn set_geo_transform(&self, transform: [f64; 6]) -> PoolResult<()> {
        *self.geo_transform_override.lock() = None;
        self.delegate_mutation(|ds| ds.set_geo_transform(transform))
    }

    fn delegate_mutation(
        &self,
        f: impl FnOnce(&dyn DatasetSource) -> anyhow::Result<()>,
    ) -> PoolResult<()> {
        match self.core.with_dataset(f) {
            Some(Ok(())) => Ok(()),
            Some(Err(source)) => Err(PoolError::Source {
                description: self.core.description.clone(),
                source,
            }),
            None => Err(PoolError::Unavailable {
                description: self.core.description.clone(),
            }),
        }
    }

    /// Snapshot of the metadata string list for `domain` ("" is the default
    /// domain), taken under a fresh lease. `None` when the dataset is
    /// unavailable or has no such domain.
    pub fn metadata(&self, domain: &str) -> Option<Vec<String>> {
        self.core.with_dataset(|ds| ds.metadata(domain)).flatten()
    }

    /// Snapshot of one metadata item, taken under a fresh lease.
    pub fn metadata_item(&self, name: &str, domain: &str) -> Option<String> {
        self.core
            .with_dataset(|ds| ds.metadata_item(name, domain))
            .flatten()
    }

    /// Projection of the ground control points, refreshed from the
    /// underlying dataset on every call.
    pub fn gcp_projection(&self) -> Option<String> {
        self.core.with_dataset(|ds| ds.gcp_projection())
    }

    /// Ground control points, refreshed from the underlying dataset on
    /// every call.
    pub fn gcps(&self) -> Option<Vec<Gcp>> {
        self.core.with_dataset(|ds| ds.gcps())
    }

    /// Delegated format-internal handle. The returned value can be
    /// invalidated whenever the pool recycles the entry, which is why this
    /// warns on every call.
    pub fn internal_handle(&self, request: &str) -> *mut c_void {
        log::warn!(
            "internal_handle() cannot be safely called on a proxy dataset: \
             the returned value may be invalidated at any time"
        );
        self.core
            .with_dataset(|ds| ds.internal_handle(request))
            .unwrap_or(std::ptr::null_mut())
    }
}

impl Drop for ProxyDataset {
    fn drop(&mut self) {
        // A shared entry is left cached: other proxies with the same
        // description may still want it. A non-shared one is closed now if
        // idle.
        if !self.core.shared {
            pool::close_dataset(&self.core.description, self.core.access);
        }
        pool::release();
    }
}
