use std::sync::{Mutex, MutexGuard};

/// Lock a potentially poisoned Mutex, recovering from poison.
///
/// Guards are short-held and never live across an await.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Mutex was poisoned, recovering guard");
        poisoned.into_inner()
    })
}
