use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aero_fence::{Fence, FenceContexts, FenceError, Timeout, WaitError};
use tracing::{debug, error, warn};

use crate::backend::{BackendSubmission, EngineBackend};
use crate::config::{ContextConfig, EngineClass, EngineConfig, EngineId};
use crate::context::Context;
use crate::doorbell::Doorbell;
use crate::error::{Result, SubmitError};
use crate::inflight::InFlightTracker;
use crate::request::{Request, RequestState};
use crate::stats::SchedStats;
use crate::sync::{deadline_for, lock, remaining};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    /// No wakerefs, nothing queued.
    Idle,
    /// Held awake but with nothing executing.
    Awake,
    /// Work queued or executing.
    Busy,
    /// Refusing work until recovered.
    Wedged,
}

struct EngineState {
    backend: Box<dyn EngineBackend>,
    /// Ready requests not yet handed to the backend, in arrival order.
    queue: VecDeque<Request>,
    parked: Vec<Request>,
    in_flight: InFlightTracker<Request>,
    /// Every added request from `add` until it terminates, keyed by (context, add order).
    outstanding: BTreeMap<(u64, u64), Request>,
    wedged: bool,
    wedge_reason: Option<String>,
    wakerefs: usize,
    dispatcher_awake: bool,
    busy_since: Option<Instant>,
    busy_total: Duration,
}

struct EngineShared {
    id: EngineId,
    name: String,
    config: EngineConfig,
    context_config: ContextConfig,
    /// Serialises fence signaling against wedging so a wedge never overtakes a retirement.
    /// Always taken before `state`.
    signal_lock: Mutex<()>,
    state: Mutex<EngineState>,
    doorbell: Doorbell,
    shutdown: AtomicBool,
    stats: Arc<SchedStats>,
    fence_contexts: Arc<FenceContexts>,
    kernel_context: Mutex<Option<Context>>,
}

/// Handle to one hardware engine and its scheduler.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    pub(crate) fn new(
        id: EngineId,
        config: EngineConfig,
        context_config: ContextConfig,
        mut backend: Box<dyn EngineBackend>,
        fence_contexts: Arc<FenceContexts>,
        stats: Arc<SchedStats>,
    ) -> Self {
        let doorbell = Doorbell::new();
        backend.attach(doorbell.clone());
        Self {
            shared: Arc::new(EngineShared {
                id,
                name: config.name(),
                config,
                context_config,
                signal_lock: Mutex::new(()),
                state: Mutex::new(EngineState {
                    backend,
                    queue: VecDeque::new(),
                    parked: Vec::new(),
                    in_flight: InFlightTracker::new(),
                    outstanding: BTreeMap::new(),
                    wedged: false,
                    wedge_reason: None,
                    wakerefs: 0,
                    dispatcher_awake: false,
                    busy_since: None,
                    busy_total: Duration::ZERO,
                }),
                doorbell,
                shutdown: AtomicBool::new(false),
                stats,
                fence_contexts,
                kernel_context: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> EngineId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn class(&self) -> EngineClass {
        self.shared.config.class
    }

    pub fn instance(&self) -> u8 {
        self.shared.config.instance
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> &SchedStats {
        &self.shared.stats
    }

    pub fn ptr_eq(&self, other: &Engine) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn status(&self) -> EngineStatus {
        let st = lock(&self.shared.state);
        if st.wedged {
            EngineStatus::Wedged
        } else if !st.in_flight.is_empty() || !st.queue.is_empty() {
            EngineStatus::Busy
        } else if st.wakerefs > 0 {
            EngineStatus::Awake
        } else {
            EngineStatus::Idle
        }
    }

    pub fn is_wedged(&self) -> bool {
        lock(&self.shared.state).wedged
    }

    pub fn wedge_reason(&self) -> Option<String> {
        lock(&self.shared.state).wedge_reason.clone()
    }

    /// Requests added to this engine that have not terminated yet.
    pub fn outstanding(&self) -> usize {
        lock(&self.shared.state).outstanding.len()
    }

    /// Total time the engine has spent with work in flight.
    pub fn busy_time(&self) -> Duration {
        let st = lock(&self.shared.state);
        match st.busy_since {
            Some(since) => st.busy_total + since.elapsed(),
            None => st.busy_total,
        }
    }

    pub fn create_context(&self, name: &str) -> Context {
        Context::new(
            self.clone(),
            self.shared.fence_contexts.alloc(),
            name.to_string(),
            self.shared.context_config.ring_size_bytes,
            false,
        )
    }

    /// The engine's own context, used for driver-internal work.
    pub fn kernel_context(&self) -> Context {
        lock(&self.shared.kernel_context)
            .get_or_insert_with(|| {
                Context::new(
                    self.clone(),
                    self.shared.fence_contexts.alloc(),
                    format!("{}/kernel", self.shared.name),
                    self.shared.context_config.ring_size_bytes,
                    true,
                )
            })
            .clone()
    }

    pub fn create_kernel_request(&self) -> Result<Request> {
        self.kernel_context().create_request()
    }

    /// Take a wakeref, powering the engine up if it was idle.
    pub fn pm_get(&self) -> EngineWakeref {
        let mut st = lock(&self.shared.state);
        self.get_wakeref(&mut st);
        EngineWakeref {
            engine: self.clone(),
        }
    }

    /// Queue a ready request for execution.
    ///
    /// Accepts requests whose submission gate has completed and parked requests being put back
    /// after [`Engine::unsubmit`]. On a wedged engine the request is failed with
    /// [`FenceError::Wedged`] on the spot.
    pub fn submit_request(&self, rq: &Request) -> Result<()> {
        if !rq.engine().ptr_eq(self) {
            return Err(SubmitError::InvalidState(
                "request belongs to another engine",
            ));
        }

        let mut st = lock(&self.shared.state);
        if st.wedged {
            drop(st);
            // May be running inside a fence callback under `signal_lock`; signal directly.
            self.complete_unexecuted(rq, FenceError::Wedged);
            return Err(SubmitError::Wedged);
        }
        match rq.state() {
            RequestState::Added if rq.submit_gate_done() => {}
            RequestState::Added => {
                return Err(SubmitError::InvalidState("submission gate still pending"))
            }
            RequestState::Parked => st.parked.retain(|parked| !parked.ptr_eq(rq)),
            _ => {
                return Err(SubmitError::InvalidState(
                    "request is not ready for submission",
                ))
            }
        }
        rq.set_state(RequestState::Queued);
        st.queue.push_back(rq.clone());
        drop(st);

        self.shared.doorbell.ring();
        Ok(())
    }

    /// Pull a queued request back off the engine before it is dispatched. The request is parked
    /// until handed back to [`Engine::submit_request`].
    pub fn unsubmit(&self, rq: &Request) -> bool {
        let mut st = lock(&self.shared.state);
        let Some(pos) = st.queue.iter().position(|queued| queued.ptr_eq(rq)) else {
            return false;
        };
        if let Some(parked) = st.queue.remove(pos) {
            parked.set_state(RequestState::Parked);
            st.parked.push(parked);
        }
        drop(st);

        self.shared.stats.inc_requests_unsubmitted();
        debug!(
            engine = %self.shared.name,
            context = rq.context_id(),
            seqno = rq.seqno(),
            "request unsubmitted"
        );
        true
    }

    /// Cancel a queued or parked request. Requests already handed to the backend cannot be
    /// cancelled.
    pub fn cancel_request(&self, rq: &Request) -> bool {
        let removed = {
            let mut st = lock(&self.shared.state);
            if let Some(pos) = st.queue.iter().position(|queued| queued.ptr_eq(rq)) {
                st.queue.remove(pos)
            } else if let Some(pos) = st.parked.iter().position(|parked| parked.ptr_eq(rq)) {
                Some(st.parked.swap_remove(pos))
            } else {
                None
            }
        };
        match removed {
            Some(rq) => {
                self.complete_unexecuted(&rq, FenceError::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Declare the engine wedged.
    ///
    /// Everything outstanding is failed with [`FenceError::Wedged`], context by context in add
    /// order, and new requests are refused until [`Engine::recover`]. Returns `false` if already
    /// wedged.
    ///
    /// Must not be called from inside a fence callback.
    pub fn wedge(&self, reason: &str) -> bool {
        let _signal = lock(&self.shared.signal_lock);
        let victims: Vec<Request> = {
            let mut st = lock(&self.shared.state);
            if st.wedged {
                return false;
            }
            st.wedged = true;
            st.wedge_reason = Some(reason.to_string());
            st.queue.clear();
            st.parked.clear();
            st.in_flight.drain();
            st.backend.reset();
            if let Some(since) = st.busy_since.take() {
                st.busy_total += since.elapsed();
            }
            self.release_dispatch_wakeref(&mut st);
            st.outstanding.values().cloned().collect()
        };

        warn!(
            engine = %self.shared.name,
            reason,
            outstanding = victims.len(),
            "engine wedged"
        );
        self.shared.stats.inc_wedges();

        for rq in &victims {
            rq.finish(Err(FenceError::Wedged));
        }
        let mut st = lock(&self.shared.state);
        for rq in &victims {
            st.outstanding.remove(&rq.key());
        }
        true
    }

    /// Leave the wedged state. Returns `false` if the engine was not wedged.
    pub fn recover(&self) -> bool {
        let mut st = lock(&self.shared.state);
        if !st.wedged {
            return false;
        }
        st.wedged = false;
        st.wedge_reason = None;
        st.backend.reset();
        drop(st);

        self.shared.stats.inc_recoveries();
        debug!(engine = %self.shared.name, "engine recovered");
        true
    }

    /// Wait until every request added to this engine has terminated.
    pub fn wait_for_idle(&self, timeout: impl Into<Timeout>) -> Result<()> {
        let deadline = deadline_for(timeout.into());
        loop {
            let pending: Vec<Fence> = lock(&self.shared.state)
                .outstanding
                .values()
                .map(|rq| rq.fence().clone())
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            for fence in pending {
                if let Err(WaitError::Timeout) = fence.wait(remaining(deadline)) {
                    return Err(SubmitError::Timeout);
                }
            }
            // Terminated requests leave `outstanding` just after signaling.
            std::thread::yield_now();
        }
    }

    /// Start tracking an added request. Returns `false` on a wedged engine.
    pub(crate) fn track(&self, rq: &Request) -> bool {
        let mut st = lock(&self.shared.state);
        if st.wedged {
            return false;
        }
        st.outstanding.insert(rq.key(), rq.clone());
        true
    }

    /// Terminate a request that never reached the backend.
    pub(crate) fn complete_unexecuted(&self, rq: &Request, err: FenceError) {
        rq.finish(Err(err));
        lock(&self.shared.state).outstanding.remove(&rq.key());
    }

    /// Dispatcher thread body. Returns once [`Engine::shutdown`] has been called.
    pub(crate) fn run_dispatcher(&self) {
        debug!(engine = %self.shared.name, "dispatcher started");
        loop {
            let seen = self.shared.doorbell.generation();
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            let deadline = self.dispatch();
            self.shared.doorbell.wait(seen, deadline);
        }
        debug!(engine = %self.shared.name, "dispatcher stopped");
    }

    pub(crate) fn shutdown(&self) {
        self.wedge("device shutdown");
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.doorbell.ring();
        lock(&self.shared.kernel_context).take();
    }

    /// One dispatcher pass: feed the backend, collect completions, retire in emission order.
    /// Returns when the dispatcher should look again even if the doorbell stays quiet.
    fn dispatch(&self) -> Option<Instant> {
        let signal = lock(&self.shared.signal_lock);
        let now = Instant::now();
        let mut fault = None;

        let (retired, deadline) = {
            let mut st = lock(&self.shared.state);
            if st.wedged {
                return None;
            }

            while st.in_flight.len() < self.shared.config.max_in_flight {
                let Some(rq) = st.queue.pop_front() else {
                    break;
                };
                self.wake_for_dispatch(&mut st);
                let fence = st.in_flight.next_fence();
                rq.set_state(RequestState::Executing);
                let submission = BackendSubmission {
                    engine: self.shared.id,
                    context_id: rq.context_id(),
                    seqno: rq.seqno(),
                    signal_fence: fence,
                    batch: rq.batch(),
                };
                debug!(
                    engine = %self.shared.name,
                    context = rq.context_id(),
                    seqno = rq.seqno(),
                    fence,
                    "request dispatched"
                );
                st.in_flight.insert(fence, rq, now);
                st.busy_since.get_or_insert(now);
                self.shared.stats.inc_requests_emitted();

                if let Err(err) = st.backend.emit(submission) {
                    error!(engine = %self.shared.name, fence, error = %err, "backend emit failed");
                    fault = Some(format!("backend emit failed: {err}"));
                    break;
                }
            }

            for completion in st.backend.poll_completions() {
                st.in_flight.complete(completion.fence, completion.error);
            }
            let retired = st.in_flight.retire_ready();

            if st.in_flight.is_empty() {
                if let Some(since) = st.busy_since.take() {
                    st.busy_total += now.saturating_duration_since(since);
                }
                if st.queue.is_empty() {
                    self.release_dispatch_wakeref(&mut st);
                }
            }

            let mut deadline = st.backend.next_deadline();
            if let (Some(limit), Some(oldest)) = (
                self.shared.config.hang_timeout,
                st.in_flight.oldest_emitted_at(),
            ) {
                let hang_at = oldest + limit;
                if now >= hang_at && fault.is_none() {
                    self.shared.stats.inc_hangs_detected();
                    warn!(engine = %self.shared.name, ?limit, "hang detected");
                    fault = Some(format!("request exceeded hang timeout of {limit:?}"));
                }
                deadline = Some(deadline.map_or(hang_at, |d| d.min(hang_at)));
            }
            (retired, deadline)
        };

        for (rq, error) in retired {
            debug!(
                engine = %self.shared.name,
                context = rq.context_id(),
                seqno = rq.seqno(),
                failed = error.is_some(),
                "request retired"
            );
            let result = match error {
                None => Ok(()),
                Some(msg) => Err(FenceError::Device(msg)),
            };
            rq.finish(result);
            lock(&self.shared.state).outstanding.remove(&rq.key());
        }
        drop(signal);

        if let Some(reason) = fault {
            self.wedge(&reason);
            return None;
        }
        deadline
    }

    fn get_wakeref(&self, st: &mut EngineState) {
        st.wakerefs += 1;
        if st.wakerefs == 1 {
            st.backend.power_up();
            debug!(engine = %self.shared.name, "engine awake");
        }
    }

    fn put_wakeref(&self, st: &mut EngineState) {
        st.wakerefs = st.wakerefs.saturating_sub(1);
        if st.wakerefs == 0 {
            st.backend.power_down();
            debug!(engine = %self.shared.name, "engine parked");
        }
    }

    fn wake_for_dispatch(&self, st: &mut EngineState) {
        if !st.dispatcher_awake {
            st.dispatcher_awake = true;
            self.get_wakeref(st);
        }
    }

    fn release_dispatch_wakeref(&self, st: &mut EngineState) {
        if st.dispatcher_awake {
            st.dispatcher_awake = false;
            self.put_wakeref(st);
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("status", &self.status())
            .finish()
    }
}

/// Keeps an engine powered while held.
#[must_use = "the engine may power down as soon as the wakeref is dropped"]
pub struct EngineWakeref {
    engine: Engine,
}

impl EngineWakeref {
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl Drop for EngineWakeref {
    fn drop(&mut self) {
        let mut st = lock(&self.engine.shared.state);
        self.engine.put_wakeref(&mut st);
    }
}

impl fmt::Debug for EngineWakeref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineWakeref")
            .field("engine", &self.engine.shared.name)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn engine_for_tests(
    backend: Box<dyn EngineBackend>,
    max_in_flight: usize,
    ring_size_bytes: u32,
) -> Engine {
    Engine::new(
        EngineId(0),
        EngineConfig {
            max_in_flight,
            ..EngineConfig::new(EngineClass::Render, 0)
        },
        ContextConfig { ring_size_bytes },
        backend,
        Arc::new(FenceContexts::new()),
        Arc::new(SchedStats::new()),
    )
}
