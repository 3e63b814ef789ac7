// src/owner.rs
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identity of the thread responsible for a dataset open.
///
/// The registry that sits above the pool attributes auxiliary opens (sidecar
/// files, shared sub-datasets) to the thread that reports this identity, so
/// the pool re-impersonates the original owner whenever it closes a dataset
/// on that owner's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_OWNER: OwnerId = OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed));
    static REPORTED_OWNER: Cell<Option<OwnerId>> = const { Cell::new(None) };
}

/// The owner identity the current thread reports: the impersonated one if an
/// impersonation is active, the thread's own identity otherwise.
pub fn current_owner() -> OwnerId {
    REPORTED_OWNER
        .with(Cell::get)
        .unwrap_or_else(|| THREAD_OWNER.with(|id| *id))
}

/// Make the current thread report `owner` until the guard is dropped.
///
/// Guards nest; each drop restores what was reported when it was created.
pub fn impersonate(owner: OwnerId) -> ImpersonationGuard {
    let previous = REPORTED_OWNER.with(|cell| cell.replace(Some(owner)));
    ImpersonationGuard { previous }
}

pub struct ImpersonationGuard {
    previous: Option<OwnerId>,
}

impl Drop for ImpersonationGuard {
    fn drop(&mut self) {
        REPORTED_OWNER.with(|cell| cell.set(self.previous));
    }
}
