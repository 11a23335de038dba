use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::doorbell::Doorbell;
use crate::sync::{lock, wait_until};

/// Bytes a request always takes in its context ring: the seqno write plus the user interrupt.
pub const BREADCRUMB_BYTES: u32 = 32;
/// Extra bytes for jumping into a batch buffer.
pub const BATCH_START_BYTES: u32 = 16;

/// Work carried by a request.
#[derive(Clone, Debug, Default)]
pub enum Batch {
    /// Nothing but the breadcrumb.
    #[default]
    Empty,
    /// Occupies the engine for the given duration once it reaches the head of the backend queue.
    Delay(Duration),
    /// Occupies the engine until [`Spinner::end`] is called.
    Spin(Spinner),
    /// Opaque command stream handed to the backend untouched.
    Commands(Arc<[u8]>),
}

impl Batch {
    pub fn ring_bytes(&self) -> u32 {
        match self {
            Batch::Empty => BREADCRUMB_BYTES,
            _ => BREADCRUMB_BYTES + BATCH_START_BYTES,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SpinState {
    Idle,
    Running,
    Ended,
}

struct SpinnerInner {
    state: Mutex<(SpinState, Option<Doorbell>)>,
    cond: Condvar,
}

/// Handle to a batch that spins on the engine until released.
///
/// Used to hold an engine busy: everything queued behind a spinner stays queued (and so can still
/// be unsubmitted) until the spinner is ended or the engine is reset.
#[derive(Clone)]
pub struct Spinner {
    inner: Arc<SpinnerInner>,
}

impl Default for Spinner {
    fn default() -> Self {
        Self::new()
    }
}

impl Spinner {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SpinnerInner {
                state: Mutex::new((SpinState::Idle, None)),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn batch(&self) -> Batch {
        Batch::Spin(self.clone())
    }

    /// Release the batch. Safe to call before the batch started or more than once.
    pub fn end(&self) {
        let doorbell = {
            let mut state = lock(&self.inner.state);
            state.0 = SpinState::Ended;
            self.inner.cond.notify_all();
            state.1.take()
        };
        if let Some(doorbell) = doorbell {
            doorbell.ring();
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.state).0 == SpinState::Running
    }

    pub fn is_ended(&self) -> bool {
        lock(&self.inner.state).0 == SpinState::Ended
    }

    /// Block until the engine starts executing the batch. Returns `false` on timeout or if the
    /// spinner was ended without ever running.
    pub fn wait_for_running(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.inner.state);
        loop {
            match state.0 {
                SpinState::Running => return true,
                SpinState::Ended => return false,
                SpinState::Idle => {}
            }
            if Instant::now() >= deadline {
                return false;
            }
            state = wait_until(&self.inner.cond, state, Some(deadline));
        }
    }

    /// Called by the executing backend. `doorbell` is rung when the spinner is ended.
    pub(crate) fn start(&self, doorbell: Option<Doorbell>) {
        let mut state = lock(&self.inner.state);
        if state.0 == SpinState::Idle {
            state.0 = SpinState::Running;
            state.1 = doorbell;
            self.inner.cond.notify_all();
        }
    }
}

impl fmt::Debug for Spinner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spinner")
            .field("state", &lock(&self.inner.state).0)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn ring_bytes_account_for_batch_start() {
        assert_eq!(Batch::Empty.ring_bytes(), 32);
        assert_eq!(Batch::Delay(Duration::from_millis(1)).ring_bytes(), 48);
        assert_eq!(Batch::Commands(Arc::from(vec![0u8; 4096])).ring_bytes(), 48);
    }

    #[test]
    fn spinner_lifecycle() {
        let spin = Spinner::new();
        assert!(!spin.wait_for_running(Duration::from_millis(1)));

        let bell = Doorbell::new();
        let seen = bell.generation();
        spin.start(Some(bell.clone()));
        assert!(spin.is_running());
        assert!(spin.wait_for_running(Duration::ZERO));

        spin.end();
        assert!(spin.is_ended());
        assert_ne!(bell.generation(), seen);

        // Ended spinners never restart.
        spin.start(None);
        assert!(spin.is_ended());
    }

    #[test]
    fn ended_before_start_reports_not_running() {
        let spin = Spinner::new();
        spin.end();
        assert!(!spin.wait_for_running(Duration::from_secs(1)));
    }

    #[test]
    fn wait_for_running_wakes_on_start() {
        let spin = Spinner::new();
        let starter = spin.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            starter.start(None);
        });
        assert!(spin.wait_for_running(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
