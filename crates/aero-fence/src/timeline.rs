use std::sync::atomic::{AtomicU64, Ordering};

use crate::Fence;

/// Allocator for fence timeline contexts.
///
/// Context 0 is reserved for gate fences ([`crate::SwFence`]) so allocated ids start at 1.
#[derive(Debug)]
pub struct FenceContexts {
    next: AtomicU64,
}

impl Default for FenceContexts {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceContexts {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// A fence context together with its monotonically increasing sequence counter.
#[derive(Debug)]
pub struct Timeline {
    context: u64,
    next_seqno: AtomicU64,
}

impl Timeline {
    pub fn new(context: u64) -> Self {
        Self {
            context,
            next_seqno: AtomicU64::new(1),
        }
    }

    pub fn context(&self) -> u64 {
        self.context
    }

    pub fn next_seqno(&self) -> u64 {
        self.next_seqno.fetch_add(1, Ordering::Relaxed)
    }

    /// Create an unsubmitted fence with the next sequence number on this timeline.
    pub fn create_fence(&self) -> Fence {
        Fence::new(self.context, self.next_seqno())
    }

    /// Last sequence number handed out (0 if none).
    pub fn last_seqno(&self) -> u64 {
        self.next_seqno.load(Ordering::Relaxed) - 1
    }
}
