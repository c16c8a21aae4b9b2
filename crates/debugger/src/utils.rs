use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, carrying on with the data if a panicking holder poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
