/// Reserved gap between tail and head so a full ring is distinguishable from an empty one.
pub(crate) const RING_GUARD_BYTES: u32 = 64;

/// Byte accounting for a context ring.
///
/// The ring itself holds no data; it only tracks where each request's commands would live so that
/// submissions block once the context has too much outstanding work. `head` trails the oldest
/// unretired request and `tail` is where the next one is written.
#[derive(Debug)]
pub(crate) struct Ring {
    size: u32,
    head: u32,
    tail: u32,
}

impl Ring {
    /// `size` must be a power of two.
    pub(crate) fn new(size: u32) -> Self {
        debug_assert!(size.is_power_of_two());
        Self {
            size,
            head: 0,
            tail: 0,
        }
    }

    pub(crate) fn size(&self) -> u32 {
        self.size
    }

    /// Largest reservation that can ever succeed.
    pub(crate) fn capacity(&self) -> u32 {
        self.size - RING_GUARD_BYTES
    }

    pub(crate) fn space(&self) -> u32 {
        self.head.wrapping_sub(self.tail).wrapping_sub(RING_GUARD_BYTES) & (self.size - 1)
    }

    /// Reserve `bytes`, wrapping to the start when they do not fit before the end. Returns the
    /// new tail, which becomes the head once the reservation is retired.
    pub(crate) fn reserve(&mut self, bytes: u32) -> Option<u32> {
        if bytes > self.capacity() {
            return None;
        }
        if self.head == self.tail {
            // Idle ring: restart at the beginning so any reservation within capacity fits.
            self.head = 0;
            self.tail = 0;
        }
        let to_end = self.size - self.tail;
        let (start, need) = if bytes > to_end {
            (0, to_end + bytes)
        } else {
            (self.tail, bytes)
        };
        if need > self.space() {
            return None;
        }
        self.tail = (start + bytes) & (self.size - 1);
        Some(self.tail)
    }

    pub(crate) fn retire(&mut self, new_head: u32) {
        self.head = new_head;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ring_space_excludes_guard() {
        let ring = Ring::new(256);
        assert_eq!(ring.space(), 256 - RING_GUARD_BYTES);
        assert_eq!(ring.capacity(), 192);
    }

    #[test]
    fn reserve_until_full_then_retire() {
        let mut ring = Ring::new(256);
        let mut tails = Vec::new();
        while let Some(tail) = ring.reserve(48) {
            tails.push(tail);
        }
        assert_eq!(tails, vec![48, 96, 144, 192]);
        assert_eq!(ring.space(), 0);

        ring.retire(tails[0]);
        assert_eq!(ring.space(), 48);
        assert_eq!(ring.reserve(48), Some(240));
    }

    #[test]
    fn reservation_that_straddles_the_end_wraps() {
        let mut ring = Ring::new(256);
        assert_eq!(ring.reserve(160), Some(160));
        assert_eq!(ring.reserve(32), Some(192));
        ring.retire(160);
        assert_eq!(ring.space(), 160);

        // 64 bytes to the end is not enough; the request restarts at offset 0 and the skipped
        // tail end counts against the available space.
        assert_eq!(ring.reserve(80), Some(80));
        assert_eq!(ring.space(), 16);
    }

    #[test]
    fn idle_ring_restarts_at_zero() {
        let mut ring = Ring::new(256);
        assert_eq!(ring.reserve(176), Some(176));
        ring.retire(176);
        // Would not fit before the end, and wrapping would overrun, but the ring is idle.
        assert_eq!(ring.reserve(192), Some(192));
    }

    #[test]
    fn oversized_reservation_never_fits() {
        let mut ring = Ring::new(256);
        assert_eq!(ring.reserve(193), None);
        assert_eq!(ring.size(), 256);
    }
}
