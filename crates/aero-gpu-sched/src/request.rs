use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use aero_fence::{Fence, FenceError, FenceStatus, SwFence, Timeout, WaitError};
use tracing::{debug, trace};

use crate::batch::Batch;
use crate::context::Context;
use crate::engine::Engine;
use crate::error::{Result, SubmitError};
use crate::sync::lock;

/// Lifecycle of a [`Request`].
///
/// `Created -> Added -> Queued -> Executing -> Completed`, with `Parked` as a detour for requests
/// pulled back off the engine queue and `Cancelled` as the other terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestState {
    Created,
    Added,
    Queued,
    Parked,
    Executing,
    Completed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Cancelled)
    }
}

struct RequestInner {
    context: Context,
    fence: Fence,
    /// Ordering gate: the previously added request on the timeline, the dependency gate and any
    /// plugs.
    submit: SwFence,
    /// Explicit dependencies. A failure here fails the request without running it.
    deps: SwFence,
    batch: Mutex<Batch>,
    state: Mutex<RequestState>,
    created_at: Instant,
    submitted_at: OnceLock<Instant>,
    /// Position in the context's add order.
    ticket: OnceLock<u64>,
}

/// A unit of work bound for one engine.
///
/// Cloning a request takes another reference; the request lives until the last one is dropped.
/// Dropping every handle of a request that was never added cancels it.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    pub(crate) fn new(context: Context, fence: Fence) -> Result<Self> {
        let submit = SwFence::new();
        let deps = SwFence::new();
        submit.await_sw_fence(&deps)?;

        Ok(Self {
            inner: Arc::new(RequestInner {
                context,
                fence,
                submit,
                deps,
                batch: Mutex::new(Batch::Empty),
                state: Mutex::new(RequestState::Created),
                created_at: Instant::now(),
                submitted_at: OnceLock::new(),
                ticket: OnceLock::new(),
            }),
        })
    }

    pub fn fence(&self) -> &Fence {
        &self.inner.fence
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn engine(&self) -> &Engine {
        self.inner.context.engine()
    }

    pub fn context_id(&self) -> u64 {
        self.inner.fence.context()
    }

    pub fn seqno(&self) -> u64 {
        self.inner.fence.seqno()
    }

    pub fn state(&self) -> RequestState {
        *lock(&self.inner.state)
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// When [`Request::add`] was called, if it has been.
    pub fn submitted_at(&self) -> Option<Instant> {
        self.inner.submitted_at.get().copied()
    }

    pub fn batch(&self) -> Batch {
        lock(&self.inner.batch).clone()
    }

    pub fn is_completed(&self) -> bool {
        self.inner.fence.is_signaled()
    }

    pub fn ptr_eq(&self, other: &Request) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_batch(&self, batch: Batch) -> Result<()> {
        let state = lock(&self.inner.state);
        if *state != RequestState::Created {
            return Err(SubmitError::InvalidState("batch set after add"));
        }
        *lock(&self.inner.batch) = batch;
        Ok(())
    }

    /// Do not execute before `fence` has terminated.
    ///
    /// If `fence` fails, this request fails with the same error without executing. Added requests
    /// of the same timeline are already ordered ahead of this one and are ignored; unadded ones
    /// are rejected, since they would be ordered behind it.
    pub fn await_fence(&self, fence: &Fence) -> Result<()> {
        let state = lock(&self.inner.state);
        if *state != RequestState::Created {
            return Err(SubmitError::InvalidState("await after add"));
        }
        if fence.ptr_eq(&self.inner.fence) {
            return Err(SubmitError::InvalidState("request cannot await itself"));
        }
        if fence.context() == self.context_id() {
            if fence.status() == FenceStatus::Unsubmitted {
                return Err(SubmitError::InvalidState(
                    "await on an unadded request of the same timeline",
                ));
            }
            return Ok(());
        }
        self.inner.deps.await_fence(fence)?;
        Ok(())
    }

    pub fn await_request(&self, other: &Request) -> Result<()> {
        self.await_fence(other.fence())
    }

    /// Hold submission until `gate` completes. Errors from the gate do not fail the request.
    pub fn await_sw_fence(&self, gate: &SwFence) -> Result<()> {
        let state = lock(&self.inner.state);
        if *state != RequestState::Created {
            return Err(SubmitError::InvalidState("await after add"));
        }
        self.inner.submit.await_sw_fence(gate)?;
        Ok(())
    }

    /// Commit the request. Blocks while the context ring is full.
    ///
    /// After a successful add the request is guaranteed to terminate: it completes, fails, or is
    /// swept by a wedge.
    pub fn add(&self) -> Result<()> {
        self.add_timeout(Timeout::Never)
    }

    /// Like [`Request::add`], but gives up with [`SubmitError::ResourceExhausted`] if ring space
    /// does not free up within `timeout`. The request is left unadded and can be retried.
    pub fn try_add(&self, timeout: impl Into<Timeout>) -> Result<()> {
        self.add_timeout(timeout.into())
    }

    fn add_timeout(&self, timeout: Timeout) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            match *state {
                RequestState::Created => {}
                RequestState::Cancelled => {
                    return Err(SubmitError::InvalidState("request was cancelled"))
                }
                _ => return Err(SubmitError::InvalidState("request already added")),
            }
            let bytes = lock(&self.inner.batch).ring_bytes();
            let appended = self
                .inner
                .context
                .append(&self.inner.fence, bytes, timeout)?;
            let _ = self.inner.ticket.set(appended.ticket);
            if let Some(prev) = &appended.prev {
                self.inner.submit.await_fence(prev)?;
            }
            *state = RequestState::Added;
        }

        let _ = self.inner.submitted_at.set(Instant::now());

        let engine = self.engine();
        engine.stats().inc_requests_added();
        debug!(
            engine = %engine.name(),
            context = self.context_id(),
            seqno = self.seqno(),
            "request added"
        );

        if !engine.track(self) {
            // Raced with a wedge; the request still has to terminate.
            self.finish(Err(FenceError::Wedged));
        }

        let rq = self.clone();
        self.inner
            .submit
            .fence()
            .add_callback(Box::new(move |_| rq.submission_ready()));
        self.inner.deps.commit()?;
        self.inner.submit.commit()?;
        Ok(())
    }

    /// Cancel a request that has not been added.
    pub fn cancel(&self) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if *state != RequestState::Created {
                return Err(SubmitError::InvalidState("cancel after add"));
            }
            *state = RequestState::Cancelled;
        }
        if self.inner.fence.signal(Err(FenceError::Cancelled)) {
            self.engine().stats().inc_requests_cancelled();
        }
        Ok(())
    }

    pub fn wait(&self, timeout: impl Into<Timeout>) -> std::result::Result<(), WaitError> {
        self.inner.fence.wait(timeout)
    }

    /// (context, add order). Only meaningful once added.
    pub(crate) fn key(&self) -> (u64, u64) {
        let ticket = self.inner.ticket.get().copied().unwrap_or(u64::MAX);
        (self.context_id(), ticket)
    }

    pub(crate) fn set_state(&self, next: RequestState) {
        let mut state = lock(&self.inner.state);
        if !state.is_terminal() {
            *state = next;
        }
    }

    pub(crate) fn submit_gate_done(&self) -> bool {
        self.inner.submit.is_done()
    }

    /// Move the request to its terminal state and signal the fence. Returns `false` if it had
    /// already terminated.
    pub(crate) fn finish(&self, result: std::result::Result<(), FenceError>) -> bool {
        {
            let mut state = lock(&self.inner.state);
            if state.is_terminal() {
                return false;
            }
            *state = match &result {
                Ok(()) | Err(FenceError::Device(_)) => RequestState::Completed,
                Err(_) => RequestState::Cancelled,
            };
        }

        let stats = self.engine().stats();
        match &result {
            Ok(()) => stats.inc_requests_retired(),
            Err(FenceError::Cancelled) => stats.inc_requests_cancelled(),
            Err(_) => stats.inc_requests_failed(),
        }
        self.inner.fence.signal(result)
    }

    fn submission_ready(&self) {
        if self.inner.fence.is_signaled() {
            return;
        }
        if let Some(err) = self.inner.deps.error() {
            debug!(
                context = self.context_id(),
                seqno = self.seqno(),
                error = %err,
                "dependency failed, request not executed"
            );
            self.engine().complete_unexecuted(self, err);
            return;
        }
        if let Err(err) = self.engine().submit_request(self) {
            trace!(
                context = self.context_id(),
                seqno = self.seqno(),
                error = %err,
                "submission refused"
            );
        }
    }
}

impl Drop for RequestInner {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        };
        if state == RequestState::Created && self.fence.signal(Err(FenceError::Cancelled)) {
            self.context.engine().stats().inc_requests_cancelled();
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("context", &self.context_id())
            .field("seqno", &self.seqno())
            .field("state", &self.state())
            .field("fence", &self.inner.fence.status())
            .finish()
    }
}
