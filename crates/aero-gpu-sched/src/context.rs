use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use aero_fence::{Fence, Timeline, Timeout, WaitError};

use crate::config::EngineId;
use crate::engine::Engine;
use crate::error::{Result, SubmitError};
use crate::request::Request;
use crate::ring::Ring;
use crate::sync::{deadline_for, lock, remaining, wait_until};

struct ContextRing {
    ring: Ring,
    /// Added requests that have not retired, with the ring tail after each.
    outstanding: VecDeque<(Fence, u32)>,
    /// Timeline tail: the next added request is ordered after it.
    last_added: Option<Fence>,
    /// Add-order position handed to the next request.
    next_ticket: u64,
}

/// Where an added request landed on its timeline.
pub(crate) struct Appended {
    /// The request it must not overtake.
    pub(crate) prev: Option<Fence>,
    pub(crate) ticket: u64,
}

struct ContextInner {
    timeline: Timeline,
    name: String,
    engine: Engine,
    kernel: bool,
    ring: Mutex<ContextRing>,
    space: Condvar,
}

/// An execution context: one timeline of requests on one engine.
///
/// Requests on a context complete in the order they were added. Each request takes space in
/// the context ring from `add` until it retires.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub(crate) fn new(engine: Engine, id: u64, name: String, ring_size: u32, kernel: bool) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                timeline: Timeline::new(id),
                name,
                engine,
                kernel,
                ring: Mutex::new(ContextRing {
                    ring: Ring::new(ring_size),
                    outstanding: VecDeque::new(),
                    last_added: None,
                    next_ticket: 0,
                }),
                space: Condvar::new(),
            }),
        }
    }

    /// Fence context of this timeline.
    pub fn id(&self) -> u64 {
        self.inner.timeline.context()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub fn is_kernel(&self) -> bool {
        self.inner.kernel
    }

    pub fn create_request(&self) -> Result<Request> {
        let engine = self.engine();
        if engine.is_wedged() {
            return Err(SubmitError::Wedged);
        }

        let fence = self.inner.timeline.create_fence();
        engine.stats().inc_requests_created();
        Request::new(self.clone(), fence)
    }

    /// Fence of the most recently added request.
    pub fn last_request(&self) -> Option<Fence> {
        lock(&self.inner.ring).last_added.clone()
    }

    /// Number of added requests that have not retired.
    pub fn outstanding(&self) -> usize {
        lock(&self.inner.ring).outstanding.len()
    }

    pub fn ring_size(&self) -> u32 {
        lock(&self.inner.ring).ring.size()
    }

    pub fn ring_space(&self) -> u32 {
        lock(&self.inner.ring).ring.space()
    }

    /// Wait until every added request has terminated, successfully or not.
    pub fn wait_idle(&self, timeout: impl Into<Timeout>) -> Result<()> {
        let deadline = deadline_for(timeout.into());
        let pending: Vec<Fence> = lock(&self.inner.ring)
            .outstanding
            .iter()
            .map(|(fence, _)| fence.clone())
            .collect();
        for fence in pending {
            if let Err(WaitError::Timeout) = fence.wait(remaining(deadline)) {
                return Err(SubmitError::Timeout);
            }
        }
        Ok(())
    }

    /// Reserve ring space for `fence` and make it the timeline tail.
    ///
    /// Ring reservation and the timeline link happen under one lock, so ring order, execution
    /// order and retirement order are all add order.
    pub(crate) fn append(&self, fence: &Fence, bytes: u32, timeout: Timeout) -> Result<Appended> {
        let deadline = deadline_for(timeout);
        let mut ring = lock(&self.inner.ring);
        let tail = loop {
            let capacity = ring.ring.capacity();
            if bytes > capacity {
                return Err(SubmitError::ResourceExhausted {
                    requested: bytes,
                    capacity,
                });
            }
            if let Some(tail) = ring.ring.reserve(bytes) {
                break tail;
            }
            if deadline.is_some_and(|deadline| std::time::Instant::now() >= deadline) {
                return Err(SubmitError::ResourceExhausted {
                    requested: bytes,
                    capacity,
                });
            }
            ring = wait_until(&self.inner.space, ring, deadline);
        };
        ring.outstanding.push_back((fence.clone(), tail));
        // Armed before the lock drops: a pending fence of this timeline is always ahead of the
        // next append.
        fence.arm();
        let prev = ring.last_added.replace(fence.clone());
        let ticket = ring.next_ticket;
        ring.next_ticket += 1;
        drop(ring);

        let ctx = self.clone();
        fence.add_callback(Box::new(move |_| ctx.retire()));
        Ok(Appended { prev, ticket })
    }

    /// Release ring space of every terminated request at the head of the timeline.
    fn retire(&self) {
        let mut ring = lock(&self.inner.ring);
        let mut freed = false;
        while let Some((fence, tail)) = ring.outstanding.front() {
            if !fence.is_signaled() {
                break;
            }
            let tail = *tail;
            ring.ring.retire(tail);
            ring.outstanding.pop_front();
            freed = true;
        }
        if freed {
            self.inner.space.notify_all();
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id())
            .field("name", &self.inner.name)
            .field("engine", &self.inner.engine.name())
            .field("kernel", &self.inner.kernel)
            .finish()
    }
}

/// A client context: one [`Context`] per engine, created on first use.
pub struct UserContext {
    name: String,
    engines: Vec<Engine>,
    contexts: Mutex<BTreeMap<EngineId, Context>>,
}

impl UserContext {
    pub(crate) fn new(name: String, engines: Vec<Engine>) -> Self {
        Self {
            name,
            engines,
            contexts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self, id: EngineId) -> Result<Context> {
        let mut contexts = lock(&self.contexts);
        if let Some(ctx) = contexts.get(&id) {
            return Ok(ctx.clone());
        }
        let engine = self
            .engines
            .iter()
            .find(|engine| engine.id() == id)
            .ok_or(SubmitError::UnknownEngine(id))?;
        let ctx = engine.create_context(&format!("{}/{}", self.name, engine.name()));
        contexts.insert(id, ctx.clone());
        Ok(ctx)
    }
}

impl fmt::Debug for UserContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserContext")
            .field("name", &self.name)
            .field("contexts", &lock(&self.contexts).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;
    use crate::engine::engine_for_tests;
    use crate::request::RequestState;

    #[test]
    fn ring_space_is_taken_at_add_and_returned_at_retire() {
        let engine = engine_for_tests(Box::new(NullBackend::new()), 1, 256);
        let ctx = engine.create_context("ring");
        let full = ctx.ring_space();
        assert_eq!(full, 192);

        let rq = ctx.create_request().unwrap();
        assert_eq!(ctx.ring_space(), full, "creating a request takes no space");
        rq.add().unwrap();
        assert_eq!(ctx.ring_space(), full - 32);
        assert_eq!(ctx.outstanding(), 1);
        assert!(ctx.last_request().is_some_and(|fence| fence.ptr_eq(rq.fence())));

        let mut added = vec![rq];
        loop {
            let rq = ctx.create_request().unwrap();
            match rq.try_add(Timeout::Poll) {
                Ok(()) => added.push(rq),
                Err(err) => {
                    assert_eq!(
                        err,
                        SubmitError::ResourceExhausted {
                            requested: 32,
                            capacity: 192
                        }
                    );
                    assert_eq!(rq.state(), RequestState::Created);
                    break;
                }
            }
        }
        assert_eq!(added.len(), 6);

        engine.wedge("drain");
        assert_eq!(ctx.outstanding(), 0);
        assert_eq!(ctx.ring_space(), full);
        ctx.wait_idle(Timeout::Poll).unwrap();
    }

    #[test]
    fn kernel_context_is_shared() {
        let engine = engine_for_tests(Box::new(NullBackend::new()), 1, 256);
        let a = engine.kernel_context();
        let b = engine.kernel_context();
        assert!(a.is_kernel());
        assert_eq!(a.id(), b.id());
        assert_eq!(a.name(), "rcs0/kernel");
        assert!(!engine.create_context("user").is_kernel());
    }
}
