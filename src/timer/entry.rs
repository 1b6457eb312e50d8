//! Periodic task record and the handle given back to callers.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifier assigned to each timer by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// State shared between a queued entry and every [`TimerHandle`] pointing at it.
#[derive(Debug, Default)]
struct TimerShared {
    cancelled: AtomicBool,
    fired: AtomicU64,
}

/// A single periodic task: period, handler and the absolute time it next becomes due.
///
/// Entries are ordered by `next_due`, then by the sequence number the queue stamps on every
/// insertion, so equal deadlines fire in insertion order. The ordering is reversed so that a
/// `BinaryHeap` (max-heap) pops the earliest entry first.
///
/// Cloning an entry is cheap: the handler and the shared state are reference counted.
#[derive(Clone)]
pub struct TimerEntry<H> {
    id: TimerId,
    period: Duration,
    handler: H,
    next_due: Instant,
    pub(crate) sequence: u64,
    shared: Arc<TimerShared>,
}

impl<H> TimerEntry<H> {
    /// Create an entry first due one `period` after `now`.
    pub fn new(id: TimerId, period: Duration, handler: H, now: Instant) -> Self {
        Self::starting_at(id, period, handler, now + period)
    }

    /// Create an entry with an explicit first due time.
    pub fn starting_at(id: TimerId, period: Duration, handler: H, first_due: Instant) -> Self {
        Self {
            id,
            period,
            handler,
            next_due: first_due,
            sequence: 0,
            shared: Arc::new(TimerShared::default()),
        }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Instant at or after which the handler becomes eligible to run.
    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    /// Advance the due time by exactly one period from the previous due time.
    ///
    /// Does not read the clock: a late or slow firing leaves the cadence untouched, and
    /// missed periods fire back-to-back.
    pub fn rearm(&mut self) {
        self.next_due += self.period;
    }

    /// Record one completed invocation and return the new total.
    pub(crate) fn record_firing(&self) -> u64 {
        self.shared.fired.fetch_add(1, AtomicOrdering::Relaxed) + 1
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(AtomicOrdering::Acquire)
    }

    /// Handle sharing this entry's cancellation flag and firing counter.
    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            id: self.id,
            period: self.period,
            shared: self.shared.clone(),
        }
    }
}

impl<H> std::fmt::Debug for TimerEntry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEntry")
            .field("id", &self.id)
            .field("period", &self.period)
            .field("next_due", &self.next_due)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl<H> PartialEq for TimerEntry<H> {
    fn eq(&self, other: &Self) -> bool {
        self.next_due == other.next_due && self.sequence == other.sequence
    }
}

impl<H> Eq for TimerEntry<H> {}

impl<H> PartialOrd for TimerEntry<H> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<H> Ord for TimerEntry<H> {
    /// Reverse order: the earliest deadline (then lowest sequence) is the heap maximum.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .next_due
            .cmp(&self.next_due)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Caller-side view of a registered timer.
///
/// The handle does not keep the timer alive and dropping it does not cancel anything.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: TimerId,
    period: Duration,
    shared: Arc<TimerShared>,
}

impl TimerHandle {
    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Retire the timer. A firing already running completes, but the entry is never
    /// re-armed and a queued entry is discarded when it reaches the head of the queue.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, AtomicOrdering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(AtomicOrdering::Acquire)
    }

    /// Number of invocations that have completed so far (successfully or not).
    pub fn fired(&self) -> u64 {
        self.shared.fired.load(AtomicOrdering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    fn entry(id: u64, due: Instant, sequence: u64) -> TimerEntry<()> {
        let mut entry = TimerEntry::starting_at(TimerId(id), Duration::from_secs(1), (), due);
        entry.sequence = sequence;
        entry
    }

    #[test]
    fn first_due_is_one_period_after_creation() {
        let t0 = Instant::now();
        let entry = TimerEntry::new(TimerId(1), Duration::from_secs(1), (), t0);
        assert_eq!(entry.next_due(), t0 + Duration::from_secs(1));
    }

    #[test]
    fn rearm_advances_from_previous_due_time() {
        let t0 = Instant::now();
        let mut entry = TimerEntry::new(TimerId(1), Duration::from_secs(1), (), t0);
        entry.rearm();
        assert_eq!(entry.next_due(), t0 + Duration::from_secs(2));
        entry.rearm();
        assert_eq!(entry.next_due(), t0 + Duration::from_secs(3));
    }

    #[test]
    fn heap_pops_earliest_deadline_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(entry(1, now + Duration::from_millis(30), 0));
        heap.push(entry(2, now + Duration::from_millis(10), 1));
        heap.push(entry(3, now + Duration::from_millis(20), 2));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.id().0)).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn equal_deadlines_pop_in_sequence_order() {
        let due = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(entry(1, due, 2));
        heap.push(entry(2, due, 0));
        heap.push(entry(3, due, 1));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.id().0)).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn handle_shares_cancellation_and_firings() {
        let entry = TimerEntry::new(TimerId(7), Duration::from_millis(5), (), Instant::now());
        let handle = entry.handle();
        assert_eq!(handle.id(), TimerId(7));
        assert!(!entry.is_cancelled());

        assert_eq!(entry.record_firing(), 1);
        assert_eq!(handle.fired(), 1);

        handle.cancel();
        assert!(entry.is_cancelled());
        assert!(entry.clone().is_cancelled());
    }
}
