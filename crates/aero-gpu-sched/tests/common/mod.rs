//! Shared helpers for `aero-gpu-sched` integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use aero_gpu_sched::{
    BackendCompletion, BackendSubmission, Batch, Context, EngineBackend, Request,
};

/// Base unit of time for timing-sensitive tests; everything else is a multiple of it.
pub const T: Duration = Duration::from_millis(100);

/// Generous bound for things that should happen "promptly".
pub const LONG: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// A request that keeps the engine busy for `delay` once it starts executing.
pub fn mock_request(ctx: &Context, delay: Duration) -> Request {
    let rq = ctx.create_request().unwrap();
    if !delay.is_zero() {
        rq.set_batch(Batch::Delay(delay)).unwrap();
    }
    rq
}

/// Small deterministic PRNG so stress tests are reproducible from their seed.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}

/// Backend that records power transitions and otherwise completes work immediately.
#[derive(Default, Clone)]
pub struct PowerCounters {
    pub ups: Arc<AtomicUsize>,
    pub downs: Arc<AtomicUsize>,
}

impl PowerCounters {
    pub fn ups(&self) -> usize {
        self.ups.load(Ordering::SeqCst)
    }

    pub fn downs(&self) -> usize {
        self.downs.load(Ordering::SeqCst)
    }
}

pub struct PowerRecordingBackend {
    counters: PowerCounters,
    completed: Vec<BackendCompletion>,
}

impl PowerRecordingBackend {
    pub fn new(counters: PowerCounters) -> Self {
        Self {
            counters,
            completed: Vec::new(),
        }
    }
}

impl EngineBackend for PowerRecordingBackend {
    fn reset(&mut self) {
        self.completed.clear();
    }

    fn emit(&mut self, submission: BackendSubmission) -> Result<(), String> {
        self.completed.push(BackendCompletion {
            fence: submission.signal_fence,
            error: None,
        });
        Ok(())
    }

    fn poll_completions(&mut self) -> Vec<BackendCompletion> {
        std::mem::take(&mut self.completed)
    }

    fn power_up(&mut self) {
        self.counters.ups.fetch_add(1, Ordering::SeqCst);
    }

    fn power_down(&mut self) {
        self.counters.downs.fetch_add(1, Ordering::SeqCst);
    }
}
