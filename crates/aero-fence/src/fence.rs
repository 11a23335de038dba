use std::fmt;
use std::time::{Duration, Instant};

use crate::sync::{lock, Arc, Condvar, Mutex, MutexGuard};
use crate::{FenceError, WaitError};

/// Callback invoked exactly once when a fence reaches a terminal state.
pub type CallbackFn = Box<dyn FnOnce(Result<(), FenceError>) + Send + 'static>;

/// Handle returned by [`Fence::add_callback`], usable with [`Fence::remove_callback`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    /// Created but the owning work has not been queued yet.
    Unsubmitted,
    /// Queued; will eventually terminate.
    Pending,
    Signaled,
    Error(FenceError),
}

impl FenceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FenceStatus::Signaled | FenceStatus::Error(_))
    }

    /// `Some` once terminal.
    pub fn result(&self) -> Option<Result<(), FenceError>> {
        match self {
            FenceStatus::Signaled => Some(Ok(())),
            FenceStatus::Error(err) => Some(Err(err.clone())),
            FenceStatus::Unsubmitted | FenceStatus::Pending => None,
        }
    }
}

/// How long a wait may block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Report the current state without blocking.
    Poll,
    After(Duration),
    /// Block until the fence is terminal.
    Never,
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Timeout::Poll
        } else if duration == Duration::MAX {
            Timeout::Never
        } else {
            Timeout::After(duration)
        }
    }
}

struct FenceState {
    status: FenceStatus,
    callbacks: Vec<(CallbackId, CallbackFn)>,
    next_callback: u64,
    timestamp: Option<Instant>,
}

struct FenceInner {
    context: u64,
    seqno: u64,
    state: Mutex<FenceState>,
    cond: Condvar,
}

/// Shared handle to a single-shot completion signal.
///
/// Cloning takes a reference, dropping releases it; the storage goes away with the last handle.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    pub fn new(context: u64, seqno: u64) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                context,
                seqno,
                state: Mutex::new(FenceState {
                    status: FenceStatus::Unsubmitted,
                    callbacks: Vec::new(),
                    next_callback: 0,
                    timestamp: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// A fence that is already signaled.
    pub fn signaled(context: u64, seqno: u64) -> Self {
        let fence = Self::new(context, seqno);
        fence.signal(Ok(()));
        fence
    }

    pub fn context(&self) -> u64 {
        self.inner.context
    }

    pub fn seqno(&self) -> u64 {
        self.inner.seqno
    }

    /// Whether `self` and `other` are handles to the same fence.
    pub fn ptr_eq(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether `self` is ordered after `other` on the same timeline.
    pub fn is_later(&self, other: &Fence) -> bool {
        self.context() == other.context() && self.seqno() > other.seqno()
    }

    pub fn status(&self) -> FenceStatus {
        lock(&self.inner.state).status.clone()
    }

    /// True for both terminal states (signaled and error).
    pub fn is_signaled(&self) -> bool {
        lock(&self.inner.state).status.is_terminal()
    }

    pub fn error(&self) -> Option<FenceError> {
        match &lock(&self.inner.state).status {
            FenceStatus::Error(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Time at which the fence reached its terminal state.
    pub fn timestamp(&self) -> Option<Instant> {
        lock(&self.inner.state).timestamp
    }

    /// Move `Unsubmitted -> Pending`. Returns `false` (and changes nothing) in any other state.
    pub fn arm(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if state.status == FenceStatus::Unsubmitted {
            state.status = FenceStatus::Pending;
            true
        } else {
            false
        }
    }

    /// Terminate the fence. Only the first call has any effect and returns `true`.
    ///
    /// Waiters are woken before the lock is dropped; callbacks run afterwards on the calling
    /// thread, so a callback may freely take other locks or touch this fence again.
    pub fn signal(&self, result: Result<(), FenceError>) -> bool {
        let callbacks = {
            let mut state = lock(&self.inner.state);
            if state.status.is_terminal() {
                return false;
            }
            state.status = match &result {
                Ok(()) => FenceStatus::Signaled,
                Err(err) => FenceStatus::Error(err.clone()),
            };
            state.timestamp = Some(Instant::now());
            self.inner.cond.notify_all();
            std::mem::take(&mut state.callbacks)
        };

        for (_, callback) in callbacks {
            callback(result.clone());
        }
        true
    }

    /// Register `callback` to run when the fence terminates.
    ///
    /// If the fence is already terminal the callback runs synchronously before returning and
    /// `None` is returned.
    pub fn add_callback(&self, callback: CallbackFn) -> Option<CallbackId> {
        let mut state = lock(&self.inner.state);
        if let Some(result) = state.status.result() {
            drop(state);
            callback(result);
            return None;
        }

        let id = CallbackId(state.next_callback);
        state.next_callback += 1;
        state.callbacks.push((id, callback));
        Some(id)
    }

    /// Unregister a callback that has not run yet. Returns `false` if it already ran (or is
    /// running) or was never registered on this fence.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut state = lock(&self.inner.state);
        match state.callbacks.iter().position(|(cb_id, _)| *cb_id == id) {
            Some(pos) => {
                state.callbacks.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Block until the fence terminates or `timeout` expires.
    ///
    /// Waiting on an unsubmitted fence is allowed and never reports success before the fence is
    /// actually signaled.
    pub fn wait(&self, timeout: impl Into<Timeout>) -> Result<(), WaitError> {
        let mut state = lock(&self.inner.state);
        match timeout.into() {
            Timeout::Poll => {}
            Timeout::Never => {
                while !state.status.is_terminal() {
                    state = wait_cond(&self.inner.cond, state);
                }
            }
            Timeout::After(duration) => {
                // Overflowing deadlines degrade to an unbounded wait.
                let deadline = Instant::now().checked_add(duration);
                while !state.status.is_terminal() {
                    match deadline {
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                break;
                            }
                            state = wait_cond_timeout(&self.inner.cond, state, deadline - now);
                        }
                        None => state = wait_cond(&self.inner.cond, state),
                    }
                }
            }
        }

        match &state.status {
            FenceStatus::Signaled => Ok(()),
            FenceStatus::Error(err) => Err(WaitError::Failed(err.clone())),
            FenceStatus::Unsubmitted | FenceStatus::Pending => Err(WaitError::Timeout),
        }
    }

    #[cfg(test)]
    fn callback_count(&self) -> usize {
        lock(&self.inner.state).callbacks.len()
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("context", &self.inner.context)
            .field("seqno", &self.inner.seqno)
            .field("status", &self.status())
            .finish()
    }
}

fn wait_cond<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    match cond.wait(guard) {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn wait_cond_timeout<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    duration: Duration,
) -> MutexGuard<'a, T> {
    match cond.wait_timeout(guard, duration) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
    }
}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn loom_signal_races_callback_and_wait() {
        loom::model(|| {
            let fence = Fence::new(1, 1);
            fence.arm();
            let hits = Arc::new(AtomicUsize::new(0));

            let signaler = fence.clone();
            let t_signal = loom::thread::spawn(move || {
                signaler.signal(Ok(()));
            });

            let registrar = fence.clone();
            let cb_hits = Arc::clone(&hits);
            let t_register = loom::thread::spawn(move || {
                registrar.add_callback(Box::new(move |_| {
                    cb_hits.fetch_add(1, Ordering::SeqCst);
                }));
            });

            assert_eq!(fence.wait(Timeout::Never), Ok(()));

            t_signal.join().unwrap();
            t_register.join().unwrap();
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        });
    }
}
