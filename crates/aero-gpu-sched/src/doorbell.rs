use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::sync::{lock, wait_until};

#[derive(Default)]
struct DoorbellInner {
    generation: Mutex<u64>,
    cond: Condvar,
}

/// Wakeup line for an engine's dispatcher.
///
/// Submissions ring it when new work is queued and backends ring it when work completes
/// asynchronously. Every ring bumps a generation counter so a ring that lands between reading
/// the generation and going to sleep is never lost.
#[derive(Clone, Default)]
pub struct Doorbell {
    inner: Arc<DoorbellInner>,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring(&self) {
        let mut generation = lock(&self.inner.generation);
        *generation = generation.wrapping_add(1);
        self.inner.cond.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *lock(&self.inner.generation)
    }

    /// Sleep until the generation moves past `seen` or `deadline` passes.
    ///
    /// Returns `true` if the doorbell was rung.
    pub fn wait(&self, seen: u64, deadline: Option<Instant>) -> bool {
        let mut generation = lock(&self.inner.generation);
        while *generation == seen {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return false;
            }
            generation = wait_until(&self.inner.cond, generation, deadline);
        }
        true
    }
}

impl std::fmt::Debug for Doorbell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Doorbell")
            .field("generation", &self.generation())
            .finish()
    }
}
