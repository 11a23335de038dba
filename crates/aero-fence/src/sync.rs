#[cfg(all(feature = "loom", test))]
pub(crate) use loom::sync::{Arc, Condvar, Mutex, MutexGuard};
#[cfg(not(all(feature = "loom", test)))]
pub(crate) use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Lock ignoring poisoning.
///
/// Fence state is only ever mutated through short critical sections that cannot leave it half
/// updated, so a panic on another thread does not invalidate it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
