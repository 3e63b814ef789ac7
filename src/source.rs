// src/source.rs
use std::ffi::c_void;

/// Access mode requested when a dataset is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    Update,
}

/// Pixel data type advertised by a raster band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RasterDataType {
    Unknown,
    Byte,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
}

/// A single ground control point.
#[derive(Debug, Clone, PartialEq)]
pub struct Gcp {
    pub id: String,
    pub info: String,
    pub pixel: f64,
    pub line: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// One palette entry, four 16-bit components (interpretation is up to the
/// producing format).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorEntry {
    pub c1: i16,
    pub c2: i16,
    pub c3: i16,
    pub c4: i16,
}

/// A color table, cloned out of the underlying band on demand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColorTable {
    pub entries: Vec<ColorEntry>,
}

/// An opened raster dataset, owned by the pool while cached.
///
/// Dropping the value closes the dataset; the pool brackets every such drop
/// with owner re-impersonation and its recursion guard. Implementations must
/// tolerate being called while the pool's library-wide mutex is held, and
/// may only re-enter pool APIs through proxy construction/destruction (the
/// documented recursive-open path).
pub trait DatasetSource: Send + Sync {
    /// Well-known-text projection, empty when the dataset has none.
    fn projection(&self) -> String;

    fn set_projection(&self, wkt: &str) -> anyhow::Result<()>;

    fn geo_transform(&self) -> Option<[f64; 6]>;

    fn set_geo_transform(&self, transform: [f64; 6]) -> anyhow::Result<()>;

    /// String list ("KEY=VALUE" entries) for a metadata domain; "" is the
    /// default domain.
    fn metadata(&self, domain: &str) -> Option<Vec<String>>;

    fn metadata_item(&self, name: &str, domain: &str) -> Option<String>;

    fn gcp_projection(&self) -> String;

    fn gcps(&self) -> Vec<Gcp>;

    fn band_count(&self) -> usize;

    /// Band access, 1-based like the formats this models.
    fn band(&self, band: usize) -> Option<&dyn RasterBandSource>;

    /// Format-internal handle. Inherently unsafe to retain; proxies warn
    /// before delegating here.
    fn internal_handle(&self, _request: &str) -> *mut c_void {
        std::ptr::null_mut()
    }
}

/// A band of an opened dataset, reachable only through its dataset's lease.
pub trait RasterBandSource {
    fn band_number(&self) -> usize;

    fn data_type(&self) -> RasterDataType;

    fn size(&self) -> (usize, usize);

    fn block_size(&self) -> (usize, usize);

    fn metadata(&self, domain: &str) -> Option<Vec<String>>;

    fn metadata_item(&self, name: &str, domain: &str) -> Option<String>;

    fn category_names(&self) -> Option<Vec<String>>;

    /// Unit of the band values, empty when unset.
    fn unit_type(&self) -> String;

    fn no_data_value(&self) -> Option<f64>;

    fn color_table(&self) -> Option<ColorTable>;

    fn overview_count(&self) -> usize;

    fn overview(&self, index: usize) -> Option<&dyn RasterBandSource>;

    fn mask_band(&self) -> Option<&dyn RasterBandSource>;
}

/// The dataset-opening subsystem the pool delegates to.
///
/// `open` may block on I/O; it is invoked while the pool's mutex is held,
/// which is accepted because contending threads would serialize on the same
/// source anyway. Opening may transitively construct further proxy datasets;
/// the pool's recursion guard keeps those from pinning the pool singleton.
pub trait DatasetOpener: Send + Sync {
    fn open(
        &self,
        description: &str,
        access: AccessMode,
        open_options: &[String],
    ) -> anyhow::Result<Box<dyn DatasetSource>>;
}
