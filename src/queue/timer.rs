//! Deadline heap.
//!
//! Min-heap of `(Instant, generation, slot)`. Cancellation is lazy: a
//! registration bumps its generation and stale heap entries are skipped
//! when they surface. This keeps re-arming O(log n) with no heap
//! surgery.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use super::SlotId;

pub(crate) struct TimerHeap {
    heap: BinaryHeap<Entry>,
    next_gen: u64,
}

#[derive(PartialEq, Eq)]
struct Entry {
    deadline: Instant,
    gen: u64,
    slot: SlotId,
}

// BinaryHeap is a max-heap; flip the order to pop earliest first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.gen.cmp(&self.gen))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            // generation 0 means "no pending deadline"
            next_gen: 1,
        }
    }

    /// Schedule `slot` at `deadline`. The returned generation must be
    /// stored on the registration; an entry whose generation no longer
    /// matches is dead.
    pub(crate) fn insert(&mut self, deadline: Instant, slot: SlotId) -> u64 {
        let gen = self.next_gen;
        self.next_gen += 1;
        self.heap.push(Entry {
            deadline,
            gen,
            slot,
        });
        gen
    }

    /// Earliest pending deadline, stale entries included. Good enough
    /// as a poll-timeout bound: a stale wakeup costs one extra loop
    /// iteration, never a missed deadline.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pop every entry due at `now` or earlier.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<(SlotId, u64)> {
        let mut out = Vec::new();
        while let Some(head) = self.heap.peek() {
            if head.deadline > now {
                break;
            }
            let e = self.heap.pop().unwrap();
            out.push((e.slot, e.gen));
        }
        out
    }

    pub(crate) fn is_empty(&self) -> bool { self.heap.is_empty() }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pops_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();

        let g3 = heap.insert(base + Duration::from_millis(30), 3);
        let g1 = heap.insert(base + Duration::from_millis(10), 1);
        let g2 = heap.insert(base + Duration::from_millis(20), 2);

        assert_eq!(heap.next_deadline(), Some(base + Duration::from_millis(10)));
        assert_eq!(
            heap.pop_expired(base + Duration::from_millis(25)),
            vec![(1, g1), (2, g2)]
        );
        assert_eq!(
            heap.pop_expired(base + Duration::from_millis(35)),
            vec![(3, g3)]
        );
        assert!(heap.is_empty());
    }

    #[test]
    fn nothing_due_before_deadline() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        heap.insert(base + Duration::from_secs(10), 7);

        assert!(heap.pop_expired(base).is_empty());
        assert!(!heap.is_empty());
    }

    #[test]
    fn generations_are_unique() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        let a = heap.insert(base, 1);
        let b = heap.insert(base, 1);
        assert_ne!(a, b);
    }
}
