use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Locks `lock`, recovering the guard if a previous holder panicked.
///
/// In-process stores hold plain maps, so a poisoned guard is still usable;
/// the recovery is logged with the owning module and operation.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    owner: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!(
            op,
            owner,
            result = "poisoned_recovered",
            "Recovered poisoned in-process lock"
        );
        poisoned.into_inner()
    })
}
