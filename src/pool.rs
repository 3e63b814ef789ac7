// src/pool.rs

//! Process-wide pool of opened datasets.
//!
//! The pool is a singleton holding a bounded LRU of cache entries, each
//! pairing a dataset description with an opened [`DatasetSource`]. Proxy
//! datasets claim the singleton for their lifetime and lease entries out of
//! it around every delegated operation, so a mosaic of thousands of sources
//! keeps at most `max_size` of them open at once.
//!
//! All pool state is guarded by one library-wide reentrant mutex. Opening a
//! dataset can transitively construct further proxy datasets (a virtual
//! mosaic whose tiles are themselves virtual), which re-enters the pool on
//! the same thread; a dedicated mutex would deadlock there, and the
//! recursion guard keeps those inner proxies from pinning the singleton.

use std::cell::RefCell;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::ReentrantMutex;

use crate::error::{PoolError, PoolResult};
use crate::owner::{self, OwnerId};
use crate::source::{AccessMode, DatasetOpener, DatasetSource};
use crate::utils::config;

/// Configuration option naming the pool capacity.
pub const MAX_POOL_SIZE_OPTION: &str = "GDAL_MAX_DATASET_POOL_SIZE";

/// Capacity used when the option is unset or out of range.
pub const DEFAULT_POOL_SIZE: usize = 100;

const MIN_POOL_SIZE: usize = 2;
const MAX_POOL_SIZE: usize = 1000;

/// A caller's temporary right to use a pooled dataset.
///
/// The lease keeps the entry's ref-count raised until it is dropped (or
/// passed to [`release_dataset`], which is the same thing spelled out).
/// A lease whose [`dataset`](DatasetLease::dataset) is `None` comes from a
/// failed open; the caller must treat the dataset as unavailable.
pub struct DatasetLease {
    index: usize,
    dataset: Option<Arc<dyn DatasetSource>>,
}

impl DatasetLease {
    pub fn dataset(&self) -> Option<&Arc<dyn DatasetSource>> {
        self.dataset.as_ref()
    }
}

impl std::fmt::Debug for DatasetLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetLease")
            .field("index", &self.index)
            .field("dataset", &self.dataset.is_some())
            .finish()
    }
}

impl Drop for DatasetLease {
    fn drop(&mut self) {
        let guard = POOL.lock();
        let mut state = guard.borrow_mut();
        match state.as_mut() {
            Some(pool) => {
                let entry = &mut pool.entries[self.index];
                assert!(entry.ref_count > 0, "dataset lease released twice");
                entry.ref_count -= 1;
                pool.debug_check_links();
            }
            None => debug_assert!(false, "dataset lease outlived the pool singleton"),
        }
    }
}

/// Aggregate pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_size: usize,
    pub current_size: usize,
    pub pool_ref_count: u32,
    /// Sum of entry ref-counts, i.e. the number of outstanding leases.
    pub leased: u32,
}

/// One cache entry as seen from outside, in head-to-tail (most to least
/// recently used) order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub description: String,
    pub access: AccessMode,
    pub ref_count: u32,
    pub live: bool,
    pub owner: OwnerId,
}

struct CacheEntry {
    description: String,
    access: AccessMode,
    owner: OwnerId,
    dataset: Option<Arc<dyn DatasetSource>>,
    ref_count: u32,
    prev: Option<usize>,
    next: Option<usize>,
}

struct DatasetPool {
    max_size: usize,
    current_size: usize,
    first: Option<usize>,
    last: Option<usize>,
    // Entry slots are never freed before pool teardown, so an index is a
    // stable handle for the pool's whole lifetime; recycling rewrites a
    // slot in place.
    entries: Vec<CacheEntry>,
    // Number of live top-level proxy datasets. The singleton is destroyed
    // when this returns to zero.
    pool_ref_count: u32,
    // Non-zero while the pool itself is inside an external open or close.
    // claim/release leave pool_ref_count untouched while it is raised, so a
    // proxy constructed transitively during an open cannot pin the pool.
    disable_ref_count: u32,
}

static POOL: Lazy<ReentrantMutex<RefCell<Option<DatasetPool>>>> =
    Lazy::new(|| ReentrantMutex::new(RefCell::new(None)));

impl DatasetPool {
    fn new(max_size: usize) -> Self {
        DatasetPool {
            max_size,
            current_size: 0,
            first: None,
            last: None,
            entries: Vec::new(),
            pool_ref_count: 0,
            disable_ref_count: 0,
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let entry = &self.entries[index];
            (entry.prev, entry.next)
        };
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.first = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.last = prev,
        }
        self.entries[index].prev = None;
        self.entries[index].next = None;
    }

    fn link_front(&mut self, index: usize) {
        self.entries[index].prev = None;
        self.entries[index].next = self.first;
        if let Some(old_first) = self.first {
            self.entries[old_first].prev = Some(index);
        }
        self.first = Some(index);
        if self.last.is_none() {
            self.last = Some(index);
        }
    }

    fn promote(&mut self, index: usize) {
        if self.first != Some(index) {
            self.unlink(index);
            self.link_front(index);
        }
    }

    fn check_links(&self) {
        assert!(self.current_size <= self.max_size);
        assert_eq!(self.entries.len(), self.current_size);
        let mut count = 0;
        let mut prev = None;
        let mut cursor = self.first;
        while let Some(index) = cursor {
            let entry = &self.entries[index];
            assert_eq!(entry.prev, prev, "inconsistent prev link at {}", index);
            count += 1;
            prev = cursor;
            cursor = entry.next;
        }
        assert_eq!(self.last, prev, "tail does not terminate the chain");
        assert_eq!(count, self.current_size, "chain length != current_size");
    }

    #[cfg(debug_assertions)]
    fn debug_check_links(&self) {
        self.check_links();
    }

    #[cfg(not(debug_assertions))]
    fn debug_check_links(&self) {}
}

impl Drop for DatasetPool {
    fn drop(&mut self) {
        // `destroy` has already drained every dataset under the recursion
        // guard; by the time the shell is dropped there is nothing left
        // that could call back into the pool.
        for entry in &self.entries {
            debug_assert_eq!(
                entry.ref_count, 0,
                "pool destroyed while '{}' is still leased",
                entry.description
            );
            debug_assert!(
                entry.dataset.is_none(),
                "pool dropped with '{}' still open",
                entry.description
            );
        }
    }
}

/// Close every cached dataset, then drop the empty pool. Runs with the
/// singleton still in place: closing a dataset can re-enter claim/release
/// and close paths (a dataset carrying an inner proxy), and those must find
/// a guarded pool rather than a missing one, so each close is bracketed
/// with the recursion guard exactly like the eviction path.
fn destroy(cell: &RefCell<Option<DatasetPool>>) {
    loop {
        let closing = {
            let mut state = cell.borrow_mut();
            let Some(pool) = state.as_mut() else {
                return;
            };
            match pool.entries.iter().position(|entry| entry.dataset.is_some()) {
                Some(index) => {
                    let entry = &mut pool.entries[index];
                    let dataset = entry.dataset.take();
                    let victim_owner = entry.owner;
                    pool.disable_ref_count += 1;
                    Some((dataset, victim_owner))
                }
                None => None,
            }
        };
        let Some((dataset, victim_owner)) = closing else {
            break;
        };
        {
            let _imp = owner::impersonate(victim_owner);
            drop(dataset);
        }
        let mut state = cell.borrow_mut();
        if let Some(pool) = state.as_mut() {
            pool.disable_ref_count -= 1;
            pool.debug_check_links();
        }
    }
    let pool = cell.borrow_mut().take();
    drop(pool);
}

/// Claim the pool singleton. Called by every top-level proxy dataset when it
/// is constructed; the singleton is created on the first claim, reading
/// [`MAX_POOL_SIZE_OPTION`] once (values outside [2, 1000] revert to the
/// default). Claims made while the pool is itself opening or closing a
/// dataset do not pin the singleton.
pub fn claim() {
    let guard = POOL.lock();
    let mut state = guard.borrow_mut();
    let pool = state.get_or_insert_with(|| {
        let configured = config::get_int_option(MAX_POOL_SIZE_OPTION, DEFAULT_POOL_SIZE as i64);
        let max_size = match usize::try_from(configured) {
            Ok(v) if (MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&v) => v,
            _ => DEFAULT_POOL_SIZE,
        };
        log::debug!("creating dataset pool, capacity {}", max_size);
        DatasetPool::new(max_size)
    });
    if pool.disable_ref_count == 0 {
        pool.pool_ref_count += 1;
    }
    pool.debug_check_links();
}

/// Release a claim on the singleton; destroys it when the last top-level
/// proxy is gone. Any dataset still cached idle is closed on behalf of the
/// owner that opened it.
pub fn release() {
    let guard = POOL.lock();
    {
        let mut state = guard.borrow_mut();
        let Some(pool) = state.as_mut() else {
            debug_assert!(false, "pool released but never claimed");
            return;
        };
        if pool.disable_ref_count != 0 {
            return;
        }
        assert!(pool.pool_ref_count > 0, "pool released more often than claimed");
        pool.pool_ref_count -= 1;
        if pool.pool_ref_count != 0 {
            pool.debug_check_links();
            return;
        }
    }
    destroy(&guard);
}

/// Defer singleton destruction until [`force_destroy`]. Used by the
/// surrounding registry to bracket its shutdown sequence.
pub fn prevent_destroy() {
    let guard = POOL.lock();
    let mut state = guard.borrow_mut();
    if let Some(pool) = state.as_mut() {
        pool.disable_ref_count += 1;
        pool.debug_check_links();
    }
}

/// Unconditionally tear the singleton down, balancing a previous
/// [`prevent_destroy`].
pub fn force_destroy() {
    let guard = POOL.lock();
    {
        let mut state = guard.borrow_mut();
        let Some(pool) = state.as_mut() else {
            return;
        };
        assert_eq!(
            pool.disable_ref_count, 1,
            "unbalanced prevent_destroy at pool shutdown"
        );
        pool.disable_ref_count -= 1;
        pool.pool_ref_count = 0;
    }
    destroy(&guard);
}

/// Lease a dataset out of the pool, opening it if needed.
///
/// Reuses a cached entry when the description matches and either the entry
/// belongs to the calling owner (`shared`) or nobody holds it (non-shared).
/// On a miss the pool opens a fresh entry, evicting the least-recently-used
/// idle entry when at capacity. Fails with [`PoolError::Exhausted`] when
/// every entry is leased; to stay out of that state, the capacity must
/// exceed the worst-case number of concurrently held leases.
pub fn acquire_dataset(
    description: &str,
    access: AccessMode,
    open_options: &[String],
    shared: bool,
    opener: &Arc<dyn DatasetOpener>,
) -> PoolResult<DatasetLease> {
    let guard = POOL.lock();
    let current = owner::current_owner();

    // Scan and bookkeeping first, under a scoped borrow: the borrow must be
    // gone before any external open or close runs, because those calls can
    // re-enter the pool on this thread.
    let (index, victim) = {
        let mut state = guard.borrow_mut();
        let pool = state.as_mut().expect("dataset pool not claimed");

        let mut last_idle = None;
        let mut cursor = pool.first;
        while let Some(i) = cursor {
            let entry = &pool.entries[i];
            cursor = entry.next;
            if entry.description == description
                && ((shared && entry.owner == current) || (!shared && entry.ref_count == 0))
            {
                pool.promote(i);
                let entry = &mut pool.entries[i];
                entry.ref_count += 1;
                let dataset = entry.dataset.clone();
                pool.debug_check_links();
                return Ok(DatasetLease { index: i, dataset });
            }
            if entry.ref_count == 0 {
                last_idle = Some(i);
            }
        }

        let (index, victim) = if pool.current_size == pool.max_size {
            let Some(victim_index) = last_idle else {
                let err = PoolError::Exhausted {
                    max_size: pool.max_size,
                };
                log::error!("{}", err);
                return Err(err);
            };
            // Recycle the idle entry farthest from the head: relink it
            // first so the chain stays consistent throughout, then close
            // its dataset outside the borrow. A victim whose dataset is
            // already gone is recycled the same way.
            let entry = &mut pool.entries[victim_index];
            entry.description.clear();
            let victim = entry.dataset.take().map(|ds| (ds, entry.owner));
            pool.unlink(victim_index);
            pool.link_front(victim_index);
            (victim_index, victim)
        } else {
            pool.entries.push(CacheEntry {
                description: String::new(),
                access,
                owner: current,
                dataset: None,
                ref_count: 0,
                prev: None,
                next: None,
            });
            let index = pool.entries.len() - 1;
            pool.current_size += 1;
            pool.link_front(index);
            (index, None)
        };

        // Pin the slot while the borrow is down so a recursive acquire
        // cannot recycle it from under us. The description stays empty
        // until the victim is fully closed.
        pool.entries[index].ref_count = 1;
        if victim.is_some() {
            pool.disable_ref_count += 1;
        }
        pool.debug_check_links();
        (index, victim)
    };

    if let Some((dataset, victim_owner)) = victim {
        log::debug!("recycling idle pool entry for '{}'", description);
        // Close by pretending we are the owner that opened this dataset, so
        // any auxiliary sources it drags down with it stay attributed to
        // that owner.
        {
            let _imp = owner::impersonate(victim_owner);
            drop(dataset);
        }
        let mut state = guard.borrow_mut();
        let pool = state.as_mut().expect("dataset pool vanished during close");
        pool.disable_ref_count -= 1;
    }

    {
        let mut state = guard.borrow_mut();
        let pool = state.as_mut().expect("dataset pool not claimed");
        let entry = &mut pool.entries[index];
        entry.description = description.to_string();
        entry.access = access;
        entry.owner = current;
        pool.disable_ref_count += 1;
    }

    log::debug!("opening '{}' into the dataset pool", description);
    let opened = opener.open(description, access, open_options);

    let mut state = guard.borrow_mut();
    let pool = state.as_mut().expect("dataset pool vanished during open");
    pool.disable_ref_count -= 1;
    let dataset = match opened {
        Ok(dataset) => Some(Arc::from(dataset)),
        Err(err) => {
            log::error!("cannot open '{}': {:#}", description, err);
            None
        }
    };
    pool.entries[index].dataset = dataset.clone();
    Ok(DatasetLease { index, dataset })
}

/// Return a lease to the pool. Equivalent to dropping it; the entry becomes
/// eligible for recycling once its last lease is gone. The dataset itself
/// stays open until evicted or closed.
pub fn release_dataset(lease: DatasetLease) {
    drop(lease);
}

/// Close the idle cache entry for `description`, if there is one. The slot
/// stays linked with an empty description, ready for reuse. Entries that are
/// currently leased are left alone, as are already-closed slots, so the call
/// is idempotent. Non-shared proxies use this at destruction to aggressively
/// drop their dataset.
pub fn close_dataset(description: &str, _access: AccessMode) {
    let guard = POOL.lock();
    let closing = {
        let mut state = guard.borrow_mut();
        let Some(pool) = state.as_mut() else {
            debug_assert!(false, "close_dataset without a claimed pool");
            return;
        };
        let mut found = None;
        let mut cursor = pool.first;
        while let Some(i) = cursor {
            let entry = &pool.entries[i];
            if entry.description == description && entry.ref_count == 0 && entry.dataset.is_some() {
                found = Some(i);
                break;
            }
            cursor = entry.next;
        }
        found.map(|i| {
            let entry = &mut pool.entries[i];
            let dataset = entry.dataset.take();
            entry.description.clear();
            pool.disable_ref_count += 1;
            (dataset, pool.entries[i].owner)
        })
    };
    let Some((dataset, victim_owner)) = closing else {
        return;
    };
    {
        let _imp = owner::impersonate(victim_owner);
        drop(dataset);
    }
    let mut state = guard.borrow_mut();
    if let Some(pool) = state.as_mut() {
        pool.disable_ref_count -= 1;
        pool.debug_check_links();
    }
}

/// Aggregate counters, or `None` when no singleton exists.
pub fn stats() -> Option<PoolStats> {
    let guard = POOL.lock();
    let state = guard.borrow();
    state.as_ref().map(|pool| PoolStats {
        max_size: pool.max_size,
        current_size: pool.current_size,
        pool_ref_count: pool.pool_ref_count,
        leased: {
            let mut leased = 0;
            let mut cursor = pool.first;
            while let Some(i) = cursor {
                leased += pool.entries[i].ref_count;
                cursor = pool.entries[i].next;
            }
            leased
        },
    })
}

/// Dump the LRU chain head to tail, or `None` when no singleton exists.
pub fn snapshot() -> Option<Vec<EntrySnapshot>> {
    let guard = POOL.lock();
    let state = guard.borrow();
    state.as_ref().map(|pool| {
        let mut entries = Vec::with_capacity(pool.current_size);
        let mut cursor = pool.first;
        while let Some(i) = cursor {
            let entry = &pool.entries[i];
            entries.push(EntrySnapshot {
                description: entry.description.clone(),
                access: entry.access,
                ref_count: entry.ref_count,
                live: entry.dataset.is_some(),
                owner: entry.owner,
            });
            cursor = entry.next;
        }
        entries
    })
}

/// Validate the chain and size invariants, panicking on any inconsistency.
/// A no-op when no singleton exists.
pub fn self_check() {
    let guard = POOL.lock();
    let state = guard.borrow();
    if let Some(pool) = state.as_ref() {
        pool.check_links();
    }
}
