//! Single-shot completion fences for the GPU submission core.
//!
//! A [`Fence`] is a cross-thread signal with an ordered `(context, seqno)` identity. It starts
//! out `Unsubmitted`, becomes `Pending` once the owning work is queued ([`Fence::arm`]) and
//! terminates exactly once, either successfully or with a [`FenceError`].
//!
//! [`SwFence`] is the software gate built on top: a commit-gated counter of outstanding fences
//! that signals its own fence once everything it awaits has completed.
//!
//! Fence identities come from a [`Timeline`], and timeline contexts are handed out by a
//! [`FenceContexts`] allocator owned by whoever owns the device; there is no process-wide state.
#![forbid(unsafe_code)]

mod fence;
mod sw_fence;
mod sync;
mod timeline;

pub use fence::{CallbackFn, CallbackId, Fence, FenceStatus, Timeout};
pub use sw_fence::SwFence;
pub use timeline::{FenceContexts, Timeline};

use thiserror::Error;

/// Error a fence terminates with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FenceError {
    /// The engine (or whole device) was declared wedged while the work was outstanding.
    #[error("engine wedged")]
    Wedged,

    /// The work was cancelled before it ran.
    #[error("request cancelled")]
    Cancelled,

    /// The backend executed the work but reported a failure.
    #[error("device error: {0}")]
    Device(String),
}

/// Outcome of a wait that did not observe a successful signal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The fence was not terminal when the timeout expired. The wait can be retried.
    #[error("timed out waiting for fence")]
    Timeout,

    /// The fence terminated with an error.
    #[error(transparent)]
    Failed(#[from] FenceError),
}

/// Misuse of a [`SwFence`] gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("invalid gate state: {0}")]
    InvalidState(&'static str),
}
