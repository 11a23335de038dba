use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

#[derive(Debug)]
struct InFlight<T> {
    item: T,
    emitted_at: Instant,
    /// `Some` once the backend reported the fence, carrying its error if any.
    completion: Option<Option<String>>,
}

/// Emission-ordered set of work handed to a backend.
///
/// Backends may report completions out of order (or even before the emission is recorded);
/// [`InFlightTracker::retire_ready`] only ever releases the oldest emissions first, so retirement
/// order always matches emission order.
#[derive(Debug)]
pub(crate) struct InFlightTracker<T> {
    in_flight: BTreeMap<u64, InFlight<T>>,
    completed_before_submit: HashMap<u64, Option<String>>,
    next_fence: u64,
    completed_fence: u64,
}

impl<T> Default for InFlightTracker<T> {
    fn default() -> Self {
        Self {
            in_flight: BTreeMap::new(),
            completed_before_submit: HashMap::new(),
            next_fence: 1,
            completed_fence: 0,
        }
    }
}

impl<T> InFlightTracker<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocate the emission number for the next submission.
    pub(crate) fn next_fence(&mut self) -> u64 {
        let fence = self.next_fence;
        self.next_fence += 1;
        fence
    }

    pub(crate) fn insert(&mut self, fence: u64, item: T, now: Instant) {
        if fence <= self.completed_fence {
            return;
        }
        let completion = self.completed_before_submit.remove(&fence);
        self.in_flight.insert(
            fence,
            InFlight {
                item,
                emitted_at: now,
                completion,
            },
        );
    }

    pub(crate) fn complete(&mut self, fence: u64, error: Option<String>) {
        if fence <= self.completed_fence {
            return;
        }
        match self.in_flight.get_mut(&fence) {
            Some(entry) => entry.completion = Some(error),
            None => {
                // The completion raced ahead of the emission bookkeeping.
                self.completed_before_submit.insert(fence, error);
            }
        }
    }

    /// Pop every completed emission at the front, oldest first.
    pub(crate) fn retire_ready(&mut self) -> Vec<(T, Option<String>)> {
        let mut retired = Vec::new();
        while let Some(entry) = self.in_flight.first_entry() {
            if entry.get().completion.is_none() {
                break;
            }
            let fence = *entry.key();
            let done = entry.remove();
            self.completed_fence = fence;
            retired.push((done.item, done.completion.flatten()));
        }
        retired
    }

    pub(crate) fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Emission time of the oldest unretired submission.
    pub(crate) fn oldest_emitted_at(&self) -> Option<Instant> {
        self.in_flight.values().next().map(|entry| entry.emitted_at)
    }

    /// Forget all emissions, returning their items in emission order. Emission numbers keep
    /// increasing so late completions from before the drain are ignored.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        self.completed_before_submit.clear();
        self.completed_fence = self.next_fence - 1;
        std::mem::take(&mut self.in_flight)
            .into_values()
            .map(|entry| entry.item)
            .collect()
    }
}
