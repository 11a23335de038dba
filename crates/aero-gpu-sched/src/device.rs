use std::sync::Arc;
use std::thread::{self, JoinHandle};

use aero_fence::{FenceContexts, Timeout};
use bitflags::bitflags;
use tracing::{debug, warn};

use crate::backend::{EngineBackend, SoftwareBackend};
use crate::config::{DeviceConfig, EngineClass, EngineConfig, EngineId};
use crate::context::{Context, UserContext};
use crate::engine::Engine;
use crate::error::{Result, SubmitError};
use crate::request::Request;
use crate::stats::SchedStats;
use crate::sync::{deadline_for, remaining};

/// Most engines a device can hold; one bit each in [`EngineMask`].
pub const MAX_ENGINES: usize = 64;

bitflags! {
    /// Set of engines, bit `n` standing for `EngineId(n)`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct EngineMask: u64 {
        const ALL = !0;
    }
}

impl EngineMask {
    pub fn engine(id: EngineId) -> Self {
        Self::from_bits_retain(1u64 << (id.0 as usize % MAX_ENGINES))
    }

    pub fn has(self, id: EngineId) -> bool {
        (id.0 as usize) < MAX_ENGINES && self.contains(Self::engine(id))
    }
}

impl From<EngineId> for EngineMask {
    fn from(id: EngineId) -> Self {
        Self::engine(id)
    }
}

/// A GPU: a set of engines with their dispatchers, sharing one fence-context allocator and one
/// set of counters.
///
/// Dropping the device wedges every engine (failing anything still outstanding) and joins the
/// dispatcher threads.
pub struct Device {
    engines: Vec<Engine>,
    dispatchers: Vec<JoinHandle<()>>,
    stats: Arc<SchedStats>,
    config: DeviceConfig,
}

impl Device {
    /// A device whose engines all run on [`SoftwareBackend`].
    pub fn new(config: DeviceConfig) -> Result<Self> {
        Self::with_backends(config, |_| Box::new(SoftwareBackend::new()))
    }

    pub fn with_backends<F>(config: DeviceConfig, mut backend_for: F) -> Result<Self>
    where
        F: FnMut(&EngineConfig) -> Box<dyn EngineBackend>,
    {
        config.validate()?;
        if config.engines.len() > MAX_ENGINES {
            return Err(SubmitError::InvalidConfig("too many engines"));
        }

        let fence_contexts = Arc::new(FenceContexts::new());
        let stats = Arc::new(SchedStats::new());
        let mut device = Device {
            engines: Vec::with_capacity(config.engines.len()),
            dispatchers: Vec::with_capacity(config.engines.len()),
            stats: Arc::clone(&stats),
            config: config.clone(),
        };

        for (idx, engine_config) in config.engines.iter().enumerate() {
            let engine = Engine::new(
                EngineId(idx as u32),
                engine_config.clone(),
                config.context.clone(),
                backend_for(engine_config),
                Arc::clone(&fence_contexts),
                Arc::clone(&stats),
            );

            let dispatcher = engine.clone();
            let handle = thread::Builder::new()
                .name(format!("gpu-sched/{}", engine.name()))
                .spawn(move || dispatcher.run_dispatcher())
                .map_err(|err| SubmitError::Backend(format!("failed to spawn dispatcher: {err}")))?;

            debug!(engine = %engine.name(), id = idx, "engine registered");
            device.engines.push(engine);
            device.dispatchers.push(handle);
        }
        Ok(device)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn engines(&self) -> &[Engine] {
        &self.engines
    }

    pub fn engine(&self, id: EngineId) -> Result<&Engine> {
        self.engines
            .get(id.0 as usize)
            .ok_or(SubmitError::UnknownEngine(id))
    }

    pub fn engine_by_class(&self, class: EngineClass, instance: u8) -> Option<&Engine> {
        self.engines
            .iter()
            .find(|engine| engine.class() == class && engine.instance() == instance)
    }

    pub fn create_context(&self, id: EngineId) -> Result<Context> {
        let engine = self.engine(id)?;
        let name = format!("{}/ctx", engine.name());
        Ok(engine.create_context(&name))
    }

    pub fn create_user_context(&self, name: &str) -> UserContext {
        UserContext::new(name.to_string(), self.engines.clone())
    }

    pub fn create_kernel_request(&self, id: EngineId) -> Result<Request> {
        self.engine(id)?.create_kernel_request()
    }

    /// Wedge every engine in `mask`. Returns how many were not already wedged.
    pub fn wedge(&self, mask: EngineMask, reason: &str) -> usize {
        let wedged = self
            .engines
            .iter()
            .filter(|engine| mask.has(engine.id()))
            .filter(|engine| engine.wedge(reason))
            .count();
        if wedged > 0 {
            warn!(engines = wedged, reason, "device wedged");
        }
        wedged
    }

    /// Recover every wedged engine in `mask`. Returns how many were recovered.
    pub fn reset(&self, mask: EngineMask) -> usize {
        self.engines
            .iter()
            .filter(|engine| mask.has(engine.id()))
            .filter(|engine| engine.recover())
            .count()
    }

    pub fn is_wedged(&self) -> bool {
        self.engines.iter().any(Engine::is_wedged)
    }

    /// Wait until every engine has drained.
    pub fn wait_for_idle(&self, timeout: impl Into<Timeout>) -> Result<()> {
        let deadline = deadline_for(timeout.into());
        for engine in &self.engines {
            engine.wait_for_idle(remaining(deadline))?;
        }
        Ok(())
    }

    pub fn stats(&self) -> &SchedStats {
        &self.stats
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        for engine in &self.engines {
            engine.shutdown();
        }
        for handle in self.dispatchers.drain(..) {
            if handle.join().is_err() {
                warn!("dispatcher thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("engines", &self.engines)
            .finish()
    }
}
