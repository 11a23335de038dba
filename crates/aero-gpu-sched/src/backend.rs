use std::collections::VecDeque;
use std::time::Instant;

use crate::batch::Batch;
use crate::config::EngineId;
use crate::doorbell::Doorbell;

#[derive(Debug, Clone)]
pub struct BackendSubmission {
    pub engine: EngineId,
    /// Fence context of the submitting context.
    pub context_id: u64,
    /// Per-context sequence number of the request.
    pub seqno: u64,
    /// Engine-wide emission number; reported back in [`BackendCompletion::fence`].
    pub signal_fence: u64,
    pub batch: Batch,
}

#[derive(Debug, Clone)]
pub struct BackendCompletion {
    pub fence: u64,
    /// If set, the submission failed on the device.
    pub error: Option<String>,
}

/// Boundary between the engine scheduler and whatever executes the work.
///
/// Implementations may complete work synchronously inside [`EngineBackend::emit`] or later,
/// surfacing completions through [`EngineBackend::poll_completions`]. Backends that complete work
/// asynchronously must ring the [`Doorbell`] handed to [`EngineBackend::attach`] so the
/// dispatcher polls again; otherwise they report a wakeup time through
/// [`EngineBackend::next_deadline`].
///
/// Completions may be reported in any order. The scheduler retires requests in emission order
/// regardless.
pub trait EngineBackend: Send {
    /// Drop all outstanding work and pending completions.
    fn reset(&mut self);

    /// Queue a submission for execution.
    ///
    /// Backends must keep fences moving: even a submission that fails on the device should still
    /// produce a completion carrying the failure. Return `Err` only for fatal backend failures
    /// where no completion can be queued; the engine is wedged in response.
    fn emit(&mut self, submission: BackendSubmission) -> Result<(), String>;

    /// Drain any completions since the last poll.
    fn poll_completions(&mut self) -> Vec<BackendCompletion>;

    /// Next time the backend expects to make progress without ringing the doorbell.
    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    fn attach(&mut self, _doorbell: Doorbell) {}

    /// The engine gained its first wakeref.
    fn power_up(&mut self) {}

    /// The engine dropped its last wakeref.
    fn power_down(&mut self) {}
}

/// Backend that accepts submissions and never completes them.
///
/// Useful for exercising timeouts and wedging: nothing ever retires on its own.
#[derive(Debug, Default)]
pub struct NullBackend;

impl NullBackend {
    pub fn new() -> Self {
        Self
    }
}

impl EngineBackend for NullBackend {
    fn reset(&mut self) {
        // Stateless.
    }

    fn emit(&mut self, _submission: BackendSubmission) -> Result<(), String> {
        Ok(())
    }

    fn poll_completions(&mut self) -> Vec<BackendCompletion> {
        Vec::new()
    }
}

/// Completes every submission as soon as it is emitted, ignoring the batch.
#[derive(Debug, Default)]
pub struct ImmediateBackend {
    completed: VecDeque<BackendCompletion>,
}

impl ImmediateBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EngineBackend for ImmediateBackend {
    fn reset(&mut self) {
        self.completed.clear();
    }

    fn emit(&mut self, submission: BackendSubmission) -> Result<(), String> {
        self.completed.push_back(BackendCompletion {
            fence: submission.signal_fence,
            error: None,
        });
        Ok(())
    }

    fn poll_completions(&mut self) -> Vec<BackendCompletion> {
        self.completed.drain(..).collect()
    }
}

#[derive(Debug)]
struct Job {
    fence: u64,
    batch: Batch,
    started: Option<Instant>,
}

/// Serial software engine that honours batch timing.
///
/// Jobs run one at a time in emission order. A [`Batch::Delay`] starts its clock when it reaches
/// the head of the queue; a [`Batch::Spin`] holds the head until its spinner is ended.
#[derive(Debug, Default)]
pub struct SoftwareBackend {
    queue: VecDeque<Job>,
    completed: Vec<BackendCompletion>,
    doorbell: Option<Doorbell>,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn advance(&mut self, now: Instant) {
        while let Some(head) = self.queue.front_mut() {
            if head.started.is_none() {
                if let Batch::Spin(spinner) = &head.batch {
                    spinner.start(self.doorbell.clone());
                }
                head.started = Some(now);
            }
            let started = head.started.unwrap_or(now);

            let done = match &head.batch {
                Batch::Empty | Batch::Commands(_) => true,
                Batch::Delay(delay) => now >= started + *delay,
                Batch::Spin(spinner) => spinner.is_ended(),
            };
            if !done {
                break;
            }

            if let Some(job) = self.queue.pop_front() {
                self.completed.push(BackendCompletion {
                    fence: job.fence,
                    error: None,
                });
            }
        }
    }
}

impl EngineBackend for SoftwareBackend {
    fn reset(&mut self) {
        for job in self.queue.drain(..) {
            if let Batch::Spin(spinner) = job.batch {
                spinner.end();
            }
        }
        self.completed.clear();
    }

    fn emit(&mut self, submission: BackendSubmission) -> Result<(), String> {
        self.queue.push_back(Job {
            fence: submission.signal_fence,
            batch: submission.batch,
            started: None,
        });
        self.advance(Instant::now());
        Ok(())
    }

    fn poll_completions(&mut self) -> Vec<BackendCompletion> {
        self.advance(Instant::now());
        std::mem::take(&mut self.completed)
    }

    fn next_deadline(&self) -> Option<Instant> {
        let head = self.queue.front()?;
        match (&head.batch, head.started) {
            (Batch::Delay(delay), Some(started)) => Some(started + *delay),
            _ => None,
        }
    }

    fn attach(&mut self, doorbell: Doorbell) {
        self.doorbell = Some(doorbell);
    }
}
