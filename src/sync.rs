use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, continuing with the inner value if a holder panicked
///
/// Every critical section in this crate leaves its data consistent before
/// calling out, so a poisoned lock carries no torn state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
