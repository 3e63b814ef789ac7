// tests/common/mod.rs
//
// In-memory opener/dataset/band fakes shared by the integration tests, plus
// the serialization fixture every pool test runs under (the pool is a
// process-wide singleton, so tests must not interleave).
#![allow(dead_code)]

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

use raster_pool::owner::{self, OwnerId};
use raster_pool::utils::config;
use raster_pool::{
    AccessMode, ColorEntry, ColorTable, DatasetOpener, DatasetSource, Gcp, RasterBandSource,
    RasterDataType,
};

static TEST_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serialized test environment: holds the test lock, checks the previous
/// test left no singleton behind, and pins the pool capacity for the
/// duration of the test.
pub struct PoolEnv {
    _guard: MutexGuard<'static, ()>,
}

pub fn pool_env(max_size: usize) -> PoolEnv {
    let guard = TEST_LOCK.lock();
    assert!(
        raster_pool::pool::stats().is_none(),
        "a previous test leaked the pool singleton"
    );
    config::set_option(
        raster_pool::pool::MAX_POOL_SIZE_OPTION,
        Some(&max_size.to_string()),
    );
    PoolEnv { _guard: guard }
}

impl Drop for PoolEnv {
    fn drop(&mut self) {
        config::set_option(raster_pool::pool::MAX_POOL_SIZE_OPTION, None);
    }
}

/// Descriptions of a pool snapshot, head to tail.
pub fn chain_descriptions() -> Vec<String> {
    raster_pool::pool::snapshot()
        .expect("no pool singleton")
        .into_iter()
        .map(|entry| entry.description)
        .collect()
}

pub struct MockBand {
    pub dataset_description: String,
    pub number: usize,
    pub data_type: RasterDataType,
    pub size: (usize, usize),
    pub block_size: (usize, usize),
    pub unit: String,
    pub categories: Vec<String>,
    pub color_table: Option<ColorTable>,
    pub no_data: Option<f64>,
    pub overviews: Vec<MockBand>,
    pub mask: Option<Box<MockBand>>,
}

impl RasterBandSource for MockBand {
    fn band_number(&self) -> usize {
        self.number
    }

    fn data_type(&self) -> RasterDataType {
        self.data_type
    }

    fn size(&self) -> (usize, usize) {
        self.size
    }

    fn block_size(&self) -> (usize, usize) {
        self.block_size
    }

    fn metadata(&self, domain: &str) -> Option<Vec<String>> {
        Some(vec![
            format!("SOURCE={}", self.dataset_description),
            format!("BAND={}", self.number),
            format!("DOMAIN={}", domain),
        ])
    }

    fn metadata_item(&self, name: &str, domain: &str) -> Option<String> {
        Some(format!(
            "{}:band{}:{}:{}",
            self.dataset_description, self.number, domain, name
        ))
    }

    fn category_names(&self) -> Option<Vec<String>> {
        if self.categories.is_empty() {
            None
        } else {
            Some(self.categories.clone())
        }
    }

    fn unit_type(&self) -> String {
        self.unit.clone()
    }

    fn no_data_value(&self) -> Option<f64> {
        self.no_data
    }

    fn color_table(&self) -> Option<ColorTable> {
        self.color_table.clone()
    }

    fn overview_count(&self) -> usize {
        self.overviews.len()
    }

    fn overview(&self, index: usize) -> Option<&dyn RasterBandSource> {
        self.overviews.get(index).map(|band| band as &dyn RasterBandSource)
    }

    fn mask_band(&self) -> Option<&dyn RasterBandSource> {
        self.mask.as_deref().map(|band| band as &dyn RasterBandSource)
    }
}

pub struct MockDataset {
    pub description: String,
    pub projection: Mutex<String>,
    pub geo_transform: Mutex<Option<[f64; 6]>>,
    pub bands: Vec<MockBand>,
    pub closed_log: Arc<Mutex<Vec<(String, OwnerId)>>>,
    /// Anything that must live exactly as long as this dataset; the
    /// recursive-open tests park an inner proxy dataset here.
    pub attachment: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Drop for MockDataset {
    fn drop(&mut self) {
        // The pool closes datasets while impersonating the owner that
        // opened them; record who that was.
        self.closed_log
            .lock()
            .push((self.description.clone(), owner::current_owner()));
    }
}

impl DatasetSource for MockDataset {
    fn projection(&self) -> String {
        self.projection.lock().clone()
    }

    fn set_projection(&self, wkt: &str) -> anyhow::Result<()> {
        *self.projection.lock() = wkt.to_string();
        Ok(())
    }

    fn geo_transform(&self) -> Option<[f64; 6]> {
        *self.geo_transform.lock()
    }

    fn set_geo_transform(&self, transform: [f64; 6]) -> anyhow::Result<()> {
        *self.geo_transform.lock() = Some(transform);
        Ok(())
    }

    fn metadata(&self, domain: &str) -> Option<Vec<String>> {
        Some(vec![
            format!("SOURCE={}", self.description),
            format!("DOMAIN={}", domain),
        ])
    }

    fn metadata_item(&self, name: &str, domain: &str) -> Option<String> {
        Some(format!("{}/{}/{}", self.description, domain, name))
    }

    fn gcp_projection(&self) -> String {
        format!("GCPWKT-{}", self.description)
    }

    fn gcps(&self) -> Vec<Gcp> {
        vec![Gcp {
            id: "1".to_string(),
            info: self.description.clone(),
            pixel: 0.5,
            line: 0.5,
            x: 10.0,
            y: 20.0,
            z: 0.0,
        }]
    }

    fn band_count(&self) -> usize {
        self.bands.len()
    }

    fn band(&self, band: usize) -> Option<&dyn RasterBandSource> {
        self.bands
            .get(band.checked_sub(1)?)
            .map(|band| band as &dyn RasterBandSource)
    }
}

fn make_band(
    description: &str,
    number: usize,
    size: (usize, usize),
    overviews: usize,
    with_mask: bool,
) -> MockBand {
    let overviews = (0..overviews)
        .map(|level| MockBand {
            dataset_description: description.to_string(),
            number,
            data_type: RasterDataType::UInt16,
            size: (
                (size.0 >> (level + 1)).max(1),
                (size.1 >> (level + 1)).max(1),
            ),
            block_size: (16, 16),
            unit: "dn".to_string(),
            categories: Vec::new(),
            color_table: None,
            no_data: Some(-999.0),
            overviews: Vec::new(),
            mask: None,
        })
        .collect();
    let mask = with_mask.then(|| {
        Box::new(MockBand {
            dataset_description: description.to_string(),
            number: 1,
            data_type: RasterDataType::Byte,
            size,
            block_size: (16, 16),
            unit: String::new(),
            categories: Vec::new(),
            color_table: None,
            no_data: None,
            overviews: Vec::new(),
            mask: None,
        })
    });
    MockBand {
        dataset_description: description.to_string(),
        number,
        data_type: RasterDataType::UInt16,
        size,
        block_size: (16, 16),
        unit: "dn".to_string(),
        categories: vec!["water".to_string(), "land".to_string()],
        color_table: Some(ColorTable {
            entries: vec![ColorEntry {
                c1: number as i16,
                c2: 0,
                c3: 0,
                c4: 255,
            }],
        }),
        no_data: Some(-999.0),
        overviews,
        mask,
    }
}

pub fn make_dataset(
    description: &str,
    bands: usize,
    overviews_per_band: usize,
    with_mask: bool,
    closed_log: Arc<Mutex<Vec<(String, OwnerId)>>>,
) -> MockDataset {
    MockDataset {
        description: description.to_string(),
        projection: Mutex::new(format!("WKT-{}", description)),
        geo_transform: Mutex::new(Some([0.0, 1.0, 0.0, 0.0, 0.0, -1.0])),
        bands: (1..=bands)
            .map(|number| make_band(description, number, (64, 64), overviews_per_band, with_mask))
            .collect(),
        closed_log,
        attachment: Mutex::new(None),
    }
}

/// Opener producing [`MockDataset`]s, with open/close accounting and a set
/// of descriptions made to fail.
pub struct TestOpener {
    pub open_log: Mutex<Vec<String>>,
    pub options_log: Mutex<Vec<(String, Vec<String>)>>,
    pub closed_log: Arc<Mutex<Vec<(String, OwnerId)>>>,
    pub fail: Mutex<HashSet<String>>,
    pub bands_per_dataset: usize,
    pub overviews_per_band: usize,
    pub with_mask: bool,
}

impl TestOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(TestOpener {
            open_log: Mutex::new(Vec::new()),
            options_log: Mutex::new(Vec::new()),
            closed_log: Arc::new(Mutex::new(Vec::new())),
            fail: Mutex::new(HashSet::new()),
            bands_per_dataset: 2,
            overviews_per_band: 2,
            with_mask: true,
        })
    }

    pub fn fail_for(&self, description: &str) {
        self.fail.lock().insert(description.to_string());
    }

    pub fn open_count(&self, description: &str) -> usize {
        self.open_log
            .lock()
            .iter()
            .filter(|opened| opened.as_str() == description)
            .count()
    }

    pub fn total_opens(&self) -> usize {
        self.open_log.lock().len()
    }

    pub fn closed(&self) -> Vec<(String, OwnerId)> {
        self.closed_log.lock().clone()
    }

    pub fn closed_descriptions(&self) -> Vec<String> {
        self.closed_log
            .lock()
            .iter()
            .map(|(description, _)| description.clone())
            .collect()
    }
}

impl DatasetOpener for TestOpener {
    fn open(
        &self,
        description: &str,
        _access: AccessMode,
        open_options: &[String],
    ) -> anyhow::Result<Box<dyn DatasetSource>> {
        self.open_log.lock().push(description.to_string());
        self.options_log
            .lock()
            .push((description.to_string(), open_options.to_vec()));
        if self.fail.lock().contains(description) {
            anyhow::bail!("simulated open failure for '{}'", description);
        }
        Ok(Box::new(make_dataset(
            description,
            self.bands_per_dataset,
            self.overviews_per_band,
            self.with_mask,
            Arc::clone(&self.closed_log),
        )))
    }
}

/// Opener whose datasets are themselves built from proxied sources: opening
/// one constructs a proxy dataset for an inner source, the way a virtual
/// mosaic of virtual mosaics does. The inner proxy lives as long as the
/// outer dataset.
pub struct NestingOpener {
    pub leaf: Arc<TestOpener>,
    pub inner_description: String,
}

impl DatasetOpener for NestingOpener {
    fn open(
        &self,
        description: &str,
        _access: AccessMode,
        open_options: &[String],
    ) -> anyhow::Result<Box<dyn DatasetSource>> {
        let leaf_opener: Arc<dyn DatasetOpener> = self.leaf.clone();
        let mut inner = raster_pool::ProxyDataset::new(
            &self.inner_description,
            (4, 4),
            AccessMode::ReadOnly,
            false,
            None,
            None,
            leaf_opener,
        );
        inner.add_band_description(RasterDataType::Byte, (4, 4));
        // Exercise a nested acquire while the outer open is in flight.
        inner
            .metadata_item("NESTED", "")
            .expect("inner source should open");

        let dataset = make_dataset(
            description,
            self.leaf.bands_per_dataset,
            self.leaf.overviews_per_band,
            self.leaf.with_mask,
            Arc::clone(&self.leaf.closed_log),
        );
        self.leaf.open_log.lock().push(description.to_string());
        self.leaf
            .options_log
            .lock()
            .push((description.to_string(), open_options.to_vec()));
        *dataset.attachment.lock() = Some(Box::new(inner));
        Ok(Box::new(dataset))
    }
}
