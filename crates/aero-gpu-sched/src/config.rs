use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::error::{Result, SubmitError};

/// Smallest ring accepted by [`ContextConfig`]; large enough for a handful of requests.
pub const MIN_RING_SIZE_BYTES: u32 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineClass {
    Render,
    Copy,
    Video,
    VideoEnhance,
    Compute,
}

impl EngineClass {
    pub const ALL: [EngineClass; 5] = [
        EngineClass::Render,
        EngineClass::Copy,
        EngineClass::Video,
        EngineClass::VideoEnhance,
        EngineClass::Compute,
    ];

    pub fn short_name(self) -> &'static str {
        match self {
            EngineClass::Render => "rcs",
            EngineClass::Copy => "bcs",
            EngineClass::Video => "vcs",
            EngineClass::VideoEnhance => "vecs",
            EngineClass::Compute => "ccs",
        }
    }
}

/// Index of an engine within its [`crate::Device`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(pub u32);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub class: EngineClass,
    pub instance: u8,
    /// Defaults to `<class short name><instance>`, e.g. `rcs0`.
    pub name: Option<String>,
    /// Number of requests the backend may hold at once. Requests beyond this stay on the engine
    /// queue, where they can still be unsubmitted or cancelled.
    pub max_in_flight: usize,
    /// Wedge the engine if the oldest in-flight request runs longer than this.
    pub hang_timeout: Option<Duration>,
}

impl EngineConfig {
    pub fn new(class: EngineClass, instance: u8) -> Self {
        Self {
            class,
            instance,
            name: None,
            max_in_flight: 1,
            hang_timeout: None,
        }
    }

    pub fn name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}{}", self.class.short_name(), self.instance),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextConfig {
    /// Per-context ring size. Must be a power of two.
    pub ring_size_bytes: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ring_size_bytes: 16 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    pub engines: Vec<EngineConfig>,
    pub context: ContextConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            engines: EngineClass::ALL
                .iter()
                .map(|&class| EngineConfig::new(class, 0))
                .collect(),
            context: ContextConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// A device with a single engine.
    pub fn single(class: EngineClass) -> Self {
        Self {
            engines: vec![EngineConfig::new(class, 0)],
            ..Default::default()
        }
    }

    /// A device with `count` instances of `class`.
    pub fn with_instances(class: EngineClass, count: u8) -> Self {
        Self {
            engines: (0..count).map(|i| EngineConfig::new(class, i)).collect(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.engines.is_empty() {
            return Err(SubmitError::InvalidConfig("device has no engines"));
        }

        let mut seen = HashSet::new();
        for engine in &self.engines {
            if !seen.insert((engine.class, engine.instance)) {
                return Err(SubmitError::InvalidConfig(
                    "duplicate engine class/instance",
                ));
            }
            if engine.max_in_flight == 0 {
                return Err(SubmitError::InvalidConfig("max_in_flight must be non-zero"));
            }
        }

        let ring = self.context.ring_size_bytes;
        if !ring.is_power_of_two() {
            return Err(SubmitError::InvalidConfig(
                "ring size must be a power of two",
            ));
        }
        if ring < MIN_RING_SIZE_BYTES {
            return Err(SubmitError::InvalidConfig("ring size too small"));
        }
        Ok(())
    }
}
