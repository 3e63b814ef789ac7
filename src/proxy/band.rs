// src/proxy/band.rs

//! Proxy raster bands.
//!
//! A proxy band never holds its underlying band; it locates it through the
//! owning proxy dataset's lease for the duration of each delegated call.
//! Overview and mask bands are variants that navigate one hop further, from
//! the main band's underlying band to its overview or mask.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{PoolError, PoolResult};
use crate::proxy::dataset::ProxyCore;
use crate::source::{ColorTable, RasterBandSource, RasterDataType};

/// How a proxy band finds its underlying band. Children hold non-owning
/// references to their main band; the proxy dataset owns the main bands.
enum BandKind {
    Plain,
    Overview {
        main: Weak<ProxyRasterBand>,
        overview: usize,
    },
    Mask {
        main: Weak<ProxyRasterBand>,
    },
}

#[derive(Default)]
struct BandChildren {
    /// Sparse, indexed by overview number; slots fill on first access and
    /// are served from here afterwards without taking a lease.
    overviews: Vec<Option<Arc<ProxyRasterBand>>>,
    mask: Option<Arc<ProxyRasterBand>>,
}

/// Advertised shape of an underlying band, captured while a lease is held
/// so the proxy for it can be built after the lease is gone.
struct BandDescription {
    band_number: usize,
    data_type: RasterDataType,
    size: (usize, usize),
    block_size: (usize, usize),
}

impl BandDescription {
    fn of(band: &dyn RasterBandSource) -> Self {
        BandDescription {
            band_number: band.band_number(),
            data_type: band.data_type(),
            size: band.size(),
            block_size: band.block_size(),
        }
    }
}

/// A band of a [`ProxyDataset`](crate::proxy::ProxyDataset).
pub struct ProxyRasterBand {
    core: Arc<ProxyCore>,
    band_number: usize,
    data_type: RasterDataType,
    x_size: usize,
    y_size: usize,
    block_x_size: usize,
    block_y_size: usize,
    kind: BandKind,
    children: Mutex<BandChildren>,
    // Handle to this band's own Arc, handed to child bands as their
    // back-reference.
    weak_self: Weak<ProxyRasterBand>,
}

impl std::fmt::Debug for ProxyRasterBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRasterBand")
            .field("band_number", &self.band_number)
            .field("data_type", &self.data_type)
            .field("x_size", &self.x_size)
            .field("y_size", &self.y_size)
            .field("block_x_size", &self.block_x_size)
            .field("block_y_size", &self.block_y_size)
            .finish()
    }
}

impl ProxyRasterBand {
    pub(crate) fn described(
        core: Arc<ProxyCore>,
        band_number: usize,
        data_type: RasterDataType,
        raster_size: (usize, usize),
        block_size: (usize, usize),
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| ProxyRasterBand {
            core,
            band_number,
            data_type,
            x_size: raster_size.0,
            y_size: raster_size.1,
            block_x_size: block_size.0,
            block_y_size: block_size.1,
            kind: BandKind::Plain,
            children: Mutex::new(BandChildren::default()),
            weak_self: weak_self.clone(),
        })
    }

    fn child(core: Arc<ProxyCore>, description: &BandDescription, kind: BandKind) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| ProxyRasterBand {
            core,
            band_number: description.band_number,
            data_type: description.data_type,
            x_size: description.size.0,
            y_size: description.size.1,
            block_x_size: description.block_size.0,
            block_y_size: description.block_size.1,
            kind,
            children: Mutex::new(BandChildren::default()),
            weak_self: weak_self.clone(),
        })
    }

    pub fn band_number(&self) -> usize {
        self.band_number
    }

    pub fn data_type(&self) -> RasterDataType {
        self.data_type
    }

    pub fn size(&self) -> (usize, usize) {
        (self.x_size, self.y_size)
    }

    pub fn block_size(&self) -> (usize, usize) {
        (self.block_x_size, self.block_y_size)
    }

    /// Run `f` against the underlying band under a short-lived lease.
    /// `None` when the dataset or the band cannot be materialized.
    fn with_underlying_band<R>(&self, f: impl FnOnce(&dyn RasterBandSource) -> R) -> Option<R> {
        let mut f = Some(f);
        let mut result = None;
        self.visit_underlying_band(&mut |band| {
            let f = f.take().expect("underlying band visited twice");
            result = Some(f(band));
        });
        result
    }

    /// Dynamically-dispatched core of `with_underlying_band`: locates the
    /// underlying band (through the dataset lease for plain bands, through
    /// the main band for overview and mask bands) and runs the visitor on
    /// it at most once.
    fn visit_underlying_band(&self, visit: &mut dyn FnMut(&dyn RasterBandSource)) {
        match &self.kind {
            BandKind::Plain => {
                let Some(lease) = self.core.ref_underlying() else {
                    return;
                };
                {
                    let dataset = lease.dataset().expect("lease verified live");
                    match dataset.band(self.band_number) {
                        Some(band) => visit(band),
                        None => log::debug!(
                            "{}",
                            PoolError::BandMissing {
                                band: self.band_number,
                                description: self.core.description().to_string(),
                            }
                        ),
                    }
                }
                self.core.unref_underlying(lease);
            }
            BandKind::Overview { main, overview } => {
                if let Some(main) = main.upgrade() {
                    let overview = *overview;
                    main.visit_underlying_band(&mut |band| {
                        if let Some(overview_band) = band.overview(overview) {
                            visit(overview_band);
                        }
                    });
                }
            }
            BandKind::Mask { main } => {
                if let Some(main) = main.upgrade() {
                    main.visit_underlying_band(&mut |band| {
                        if let Some(mask_band) = band.mask_band() {
                            visit(mask_band);
                        }
                    });
                }
            }
        }
    }

    /// Snapshot of the metadata string list for `domain`, taken under a
    /// fresh lease.
    pub fn metadata(&self, domain: &str) -> Option<Vec<String>> {
        self.with_underlying_band(|band| band.metadata(domain))
            .flatten()
    }

    /// Snapshot of one metadata item, taken under a fresh lease.
    pub fn metadata_item(&self, name: &str, domain: &str) -> Option<String> {
        self.with_underlying_band(|band| band.metadata_item(name, domain))
            .flatten()
    }

    /// Category names of the underlying band, refreshed on every call.
    pub fn category_names(&self) -> Option<Vec<String>> {
        self.with_underlying_band(|band| band.category_names())
            .flatten()
    }

    /// Unit of the band values; `None` when the band is unavailable.
    pub fn unit_type(&self) -> Option<String> {
        self.with_underlying_band(|band| band.unit_type())
    }

    pub fn no_data_value(&self) -> Option<f64> {
        self.with_underlying_band(|band| band.no_data_value())
            .flatten()
    }

    /// Deep copy of the underlying band's color table, refreshed on every
    /// call.
    pub fn color_table(&self) -> Option<ColorTable> {
        self.with_underlying_band(|band| band.color_table())
            .flatten()
    }

    pub fn overview_count(&self) -> Option<usize> {
        self.with_underlying_band(|band| band.overview_count())
    }

    /// The proxy for overview `index` of this band.
    ///
    /// The first access materializes the underlying overview to learn its
    /// shape and caches a proxy for it; later accesses return the cached
    /// proxy without taking a lease.
    pub fn overview(&self, index: usize) -> Option<Arc<ProxyRasterBand>> {
        {
            let children = self.children.lock();
            if let Some(Some(band)) = children.overviews.get(index) {
                return Some(Arc::clone(band));
            }
        }

        let description = self
            .with_underlying_band(|band| band.overview(index).map(BandDescription::of))
            .flatten()?;
        let proxy = ProxyRasterBand::child(
            Arc::clone(&self.core),
            &description,
            BandKind::Overview {
                main: self.weak_self.clone(),
                overview: index,
            },
        );

        let mut children = self.children.lock();
        if children.overviews.len() <= index {
            children.overviews.resize(index + 1, None);
        }
        let slot = &mut children.overviews[index];
        // Another thread may have raced us here; first writer wins.
        if slot.is_none() {
            *slot = Some(proxy);
        }
        slot.clone()
    }

    /// The proxy for this band's mask band, materialized and cached on
    /// first access.
    pub fn mask_band(&self) -> Option<Arc<ProxyRasterBand>> {
        {
            let children = self.children.lock();
            if let Some(band) = &children.mask {
                return Some(Arc::clone(band));
            }
        }

        let description = self
            .with_underlying_band(|band| band.mask_band().map(BandDescription::of))
            .flatten()?;
        let proxy = ProxyRasterBand::child(
            Arc::clone(&self.core),
            &description,
            BandKind::Mask {
                main: self.weak_self.clone(),
            },
        );

        let mut children = self.children.lock();
        if children.mask.is_none() {
            children.mask = Some(proxy);
        }
        children.mask.clone()
    }

    /// Pre-describe this band's mask band without opening anything, the way
    /// [`add_band_description`](crate::proxy::ProxyDataset::add_band_description)
    /// does for main bands. Panics if a mask band already exists.
    pub fn add_mask_band_description(
        &self,
        data_type: RasterDataType,
        block_size: (usize, usize),
    ) -> Arc<ProxyRasterBand> {
        let proxy = ProxyRasterBand::child(
            Arc::clone(&self.core),
            &BandDescription {
                band_number: 1,
                data_type,
                size: (self.x_size, self.y_size),
                block_size,
            },
            BandKind::Mask {
                main: self.weak_self.clone(),
            },
        );
        let mut children = self.children.lock();
        assert!(
            children.mask.is_none(),
            "mask band already described for band {}",
            self.band_number
        );
        children.mask = Some(Arc::clone(&proxy));
        proxy
    }

    /// Selecting an overview by sample count is advertised but not
    /// implemented for proxy bands.
    pub fn raster_sample_overview(
        &self,
        _desired_samples: u64,
    ) -> PoolResult<Arc<ProxyRasterBand>> {
        Err(PoolError::NotImplemented("raster_sample_overview"))
    }
}
