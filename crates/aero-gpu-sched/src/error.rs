use aero_fence::{FenceError, GateError, WaitError};
use thiserror::Error;

use crate::config::EngineId;

pub type Result<T> = std::result::Result<T, SubmitError>;

/// Unified error type for request submission.
///
/// `Timeout` is always recoverable (the operation can be retried later). `InvalidState` reports
/// a lifecycle misuse and is never silently ignored. `Wedged` means the engine refuses work until
/// it is recovered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("timed out")]
    Timeout,

    #[error("invalid request state: {0}")]
    InvalidState(&'static str),

    #[error("engine wedged")]
    Wedged,

    #[error("ring space exhausted: requested {requested} bytes, ring holds {capacity}")]
    ResourceExhausted { requested: u32, capacity: u32 },

    #[error("unknown engine {0:?}")]
    UnknownEngine(EngineId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A request terminated with an error other than a wedge.
    #[error("request failed: {0}")]
    Failed(FenceError),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<WaitError> for SubmitError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Timeout => SubmitError::Timeout,
            WaitError::Failed(FenceError::Wedged) => SubmitError::Wedged,
            WaitError::Failed(err) => SubmitError::Failed(err),
        }
    }
}

impl From<GateError> for SubmitError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::InvalidState(what) => SubmitError::InvalidState(what),
        }
    }
}
