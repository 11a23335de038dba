use std::fmt;

use crate::sync::{lock, Arc, Mutex};
use crate::{Fence, FenceError, GateError, Timeout, WaitError};

/// Timeline context used by gate fences.
const GATE_CONTEXT: u64 = 0;

struct GateState {
    /// Outstanding awaits plus one for the uncommitted gate itself.
    pending: usize,
    committed: bool,
    /// First error reported by an awaited fence.
    error: Option<FenceError>,
}

struct SwFenceInner {
    state: Mutex<GateState>,
    fence: Fence,
}

/// Commit-gated software fence.
///
/// The gate completes once it has been committed *and* every fence it awaits has terminated.
/// Awaited fences that fail are recorded (first error wins) and passed on through the gate's own
/// fence, but they do not hold the gate back.
#[derive(Clone)]
pub struct SwFence {
    inner: Arc<SwFenceInner>,
}

impl Default for SwFence {
    fn default() -> Self {
        Self::new()
    }
}

impl SwFence {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SwFenceInner {
                state: Mutex::new(GateState {
                    pending: 1,
                    committed: false,
                    error: None,
                }),
                fence: Fence::new(GATE_CONTEXT, 0),
            }),
        }
    }

    /// The fence signaled when the gate completes.
    pub fn fence(&self) -> &Fence {
        &self.inner.fence
    }

    pub fn is_committed(&self) -> bool {
        lock(&self.inner.state).committed
    }

    pub fn is_done(&self) -> bool {
        self.inner.fence.is_signaled()
    }

    /// Number of outstanding references, including the commit reference while uncommitted.
    pub fn pending(&self) -> usize {
        lock(&self.inner.state).pending
    }

    pub fn error(&self) -> Option<FenceError> {
        lock(&self.inner.state).error.clone()
    }

    /// Hold the gate until `fence` terminates.
    pub fn await_fence(&self, fence: &Fence) -> Result<(), GateError> {
        {
            let mut state = lock(&self.inner.state);
            if state.committed {
                return Err(GateError::InvalidState("await after commit"));
            }
            state.pending += 1;
        }

        let gate = self.clone();
        fence.add_callback(Box::new(move |result| gate.release(result.err())));
        Ok(())
    }

    /// Hold the gate until `other` completes.
    pub fn await_sw_fence(&self, other: &SwFence) -> Result<(), GateError> {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return Err(GateError::InvalidState("gate cannot await itself"));
        }
        self.await_fence(other.fence())
    }

    /// Drop the commit reference. No further awaits are accepted afterwards.
    pub fn commit(&self) -> Result<(), GateError> {
        {
            let mut state = lock(&self.inner.state);
            if state.committed {
                return Err(GateError::InvalidState("gate already committed"));
            }
            state.committed = true;
        }
        self.inner.fence.arm();
        self.release(None);
        Ok(())
    }

    pub fn wait(&self, timeout: impl Into<Timeout>) -> Result<(), WaitError> {
        self.inner.fence.wait(timeout)
    }

    fn release(&self, error: Option<FenceError>) {
        let outcome = {
            let mut state = lock(&self.inner.state);
            if state.error.is_none() {
                if let Some(err) = &error {
                    tracing::trace!(error = %err, "gate dependency failed");
                }
                state.error = error;
            }
            state.pending -= 1;
            if state.pending == 0 {
                Some(state.error.clone())
            } else {
                None
            }
        };

        if let Some(error) = outcome {
            self.inner.fence.signal(match error {
                Some(err) => Err(err),
                None => Ok(()),
            });
        }
    }
}

impl fmt::Debug for SwFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("SwFence")
            .field("pending", &state.pending)
            .field("committed", &state.committed)
            .field("error", &state.error)
            .finish()
    }
}
