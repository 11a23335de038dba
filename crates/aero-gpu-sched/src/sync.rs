use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use aero_fence::Timeout;

/// Lock ignoring poisoning. A panicking callback must not take the whole engine down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    match cond.wait(guard) {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn wait_timeout<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> MutexGuard<'a, T> {
    match cond.wait_timeout(guard, timeout) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
    }
}

/// Wait until `deadline`; `None` waits until notified.
pub(crate) fn wait_until<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Option<Instant>,
) -> MutexGuard<'a, T> {
    match deadline {
        None => wait(cond, guard),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                guard
            } else {
                wait_timeout(cond, guard, deadline - now)
            }
        }
    }
}

/// Absolute deadline for a relative timeout; `None` means wait forever.
pub(crate) fn deadline_for(timeout: Timeout) -> Option<Instant> {
    let now = Instant::now();
    match timeout {
        Timeout::Poll => Some(now),
        Timeout::After(duration) => now.checked_add(duration),
        Timeout::Never => None,
    }
}

/// Time left until `deadline`, as a fence timeout.
pub(crate) fn remaining(deadline: Option<Instant>) -> Timeout {
    match deadline {
        None => Timeout::Never,
        Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
            Some(left) if !left.is_zero() => Timeout::After(left),
            _ => Timeout::Poll,
        },
    }
}
