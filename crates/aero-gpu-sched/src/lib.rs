//! Request submission and scheduling for a multi-engine GPU.
//!
//! Work is described by a [`Request`] created on a [`Context`] (one timeline on one
//! [`Engine`]). A request can wait on other fences, is committed with [`Request::add`] and from
//! then on is guaranteed to terminate: it completes, fails on the device, or is swept up when its
//! engine is wedged.
//!
//! Each engine owns a dispatcher thread that feeds ready requests to an [`EngineBackend`] and
//! retires them in emission order. Requests on one context always complete in the order they
//! were added.
//!
//! ```no_run
//! use aero_gpu_sched::{Device, DeviceConfig, EngineId};
//! use std::time::Duration;
//!
//! let device = Device::new(DeviceConfig::default())?;
//! let ctx = device.create_context(EngineId(0))?;
//! let rq = ctx.create_request()?;
//! rq.add()?;
//! rq.wait(Duration::from_secs(1))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
#![forbid(unsafe_code)]

mod backend;
mod batch;
mod config;
mod context;
mod device;
mod doorbell;
mod engine;
mod error;
mod inflight;
mod request;
mod ring;
mod stats;
mod sync;

pub use aero_fence::{Fence, FenceError, FenceStatus, SwFence, Timeout, WaitError};
pub use backend::{
    BackendCompletion, BackendSubmission, EngineBackend, ImmediateBackend, NullBackend,
    SoftwareBackend,
};
pub use batch::{Batch, Spinner, BATCH_START_BYTES, BREADCRUMB_BYTES};
pub use config::{
    ContextConfig, DeviceConfig, EngineClass, EngineConfig, EngineId, MIN_RING_SIZE_BYTES,
};
pub use context::{Context, UserContext};
pub use device::{Device, EngineMask, MAX_ENGINES};
pub use doorbell::Doorbell;
pub use engine::{Engine, EngineStatus, EngineWakeref};
pub use error::{Result, SubmitError};
pub use request::{Request, RequestState};
pub use stats::{SchedStats, SchedStatsSnapshot};
