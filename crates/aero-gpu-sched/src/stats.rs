use std::sync::atomic::{AtomicU64, Ordering};

/// Device-wide scheduler counters.
///
/// Updated from submitting threads and dispatchers alike; every counter is a relaxed atomic so
/// reading them never contends with submission.
#[derive(Debug, Default)]
pub struct SchedStats {
    requests_created: AtomicU64,
    requests_added: AtomicU64,
    requests_emitted: AtomicU64,
    requests_retired: AtomicU64,
    requests_failed: AtomicU64,
    requests_cancelled: AtomicU64,
    requests_unsubmitted: AtomicU64,
    wedges: AtomicU64,
    recoveries: AtomicU64,
    hangs_detected: AtomicU64,
}

impl SchedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_requests_created(&self) {
        self.requests_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_added(&self) {
        self.requests_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_emitted(&self) {
        self.requests_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_retired(&self) {
        self.requests_retired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_unsubmitted(&self) {
        self.requests_unsubmitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_wedges(&self) {
        self.wedges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_recoveries(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_hangs_detected(&self) {
        self.hangs_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SchedStatsSnapshot {
        SchedStatsSnapshot {
            requests_created: self.requests_created.load(Ordering::Relaxed),
            requests_added: self.requests_added.load(Ordering::Relaxed),
            requests_emitted: self.requests_emitted.load(Ordering::Relaxed),
            requests_retired: self.requests_retired.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            requests_unsubmitted: self.requests_unsubmitted.load(Ordering::Relaxed),
            wedges: self.wedges.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            hangs_detected: self.hangs_detected.load(Ordering::Relaxed),
        }
    }

    /// Returns a JSON object as a string.
    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStatsSnapshot {
    pub requests_created: u64,
    pub requests_added: u64,
    pub requests_emitted: u64,
    /// Requests that completed successfully on the backend.
    pub requests_retired: u64,
    /// Requests that terminated with an error (device fault, wedge, failed dependency).
    pub requests_failed: u64,
    pub requests_cancelled: u64,
    pub requests_unsubmitted: u64,
    pub wedges: u64,
    pub recoveries: u64,
    pub hangs_detected: u64,
}

impl SchedStatsSnapshot {
    pub fn to_json(self) -> String {
        format!(
            "{{\"requests_created\":{},\"requests_added\":{},\"requests_emitted\":{},\"requests_retired\":{},\"requests_failed\":{},\"requests_cancelled\":{},\"requests_unsubmitted\":{},\"wedges\":{},\"recoveries\":{},\"hangs_detected\":{}}}",
            self.requests_created,
            self.requests_added,
            self.requests_emitted,
            self.requests_retired,
            self.requests_failed,
            self.requests_cancelled,
            self.requests_unsubmitted,
            self.wedges,
            self.recoveries,
            self.hangs_detected,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_json_contains_counters() {
        let stats = SchedStats::new();
        stats.inc_requests_created();
        stats.inc_requests_created();
        stats.inc_requests_added();
        stats.inc_wedges();

        let json = stats.to_json();
        assert!(json.starts_with('{') && json.ends_with('}'));
        assert!(json.contains("\"requests_created\":2"));
        assert!(json.contains("\"requests_added\":1"));
        assert!(json.contains("\"wedges\":1"));
        assert!(json.contains("\"recoveries\":0"));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let stats = SchedStats::new();
        let before = stats.snapshot();
        stats.inc_requests_retired();
        assert_eq!(before.requests_retired, 0);
        assert_eq!(stats.snapshot().requests_retired, 1);
    }
}
