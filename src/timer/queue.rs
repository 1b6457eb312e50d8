//! Shared timer run queue: a min-heap on due time guarded by a mutex and condition variable.
//!
//! Any thread may insert. A single scheduling thread consumes through [`TimerQueue::next_due`],
//! which blocks while the queue is empty and otherwise waits until the head's absolute
//! deadline. Every insertion signals the condition so an entry that is earlier than the one
//! being waited on preempts the wait.

use super::entry::TimerEntry;
use parking_lot::{Condvar, Mutex};
use std::collections::BinaryHeap;
use std::time::Instant;

struct QueueState<H> {
    /// Min-heap of entries ordered by due time, then insertion sequence
    heap: BinaryHeap<TimerEntry<H>>,
    /// Stamped on each insertion to break due-time ties in FIFO order
    next_sequence: u64,
}

impl<H> QueueState<H> {
    /// Pop cancelled entries sitting at the head so the head is always a live timer.
    fn discard_cancelled(&mut self) {
        while self.heap.peek().is_some_and(TimerEntry::is_cancelled) {
            if let Some(entry) = self.heap.pop() {
                log::debug!("discarding cancelled {}", entry.id());
            }
        }
    }
}

/// Thread-safe priority queue of periodic timers.
pub struct TimerQueue<H> {
    state: Mutex<QueueState<H>>,
    /// Signalled on every insertion and on shutdown
    available: Condvar,
}

impl<H> TimerQueue<H> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_sequence: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Insert an entry keyed by its due time and wake the scheduler.
    pub fn insert(&self, mut entry: TimerEntry<H>) {
        {
            let mut state = self.state.lock();
            entry.sequence = state.next_sequence;
            state.next_sequence += 1;
            state.heap.push(entry);
        }
        // The new entry may be earlier than the deadline the scheduler is sleeping towards.
        self.available.notify_one();
    }

    /// Pop the head entry if it is due at `now`, without blocking.
    pub fn pop_due(&self, now: Instant) -> Option<TimerEntry<H>> {
        let mut state = self.state.lock();
        state.discard_cancelled();
        let head_due = state.heap.peek().is_some_and(|head| head.next_due() <= now);
        if head_due {
            state.heap.pop()
        } else {
            None
        }
    }

    /// Block until the earliest entry is due and pop it.
    ///
    /// `keep_running` is evaluated under the queue lock before every wait; once it returns
    /// false this returns `None`. Pair it with [`TimerQueue::wake_all`] after flipping the
    /// condition so a sleeping scheduler notices.
    pub fn next_due(&self, keep_running: impl Fn() -> bool) -> Option<TimerEntry<H>> {
        let mut state = self.state.lock();
        loop {
            if !keep_running() {
                return None;
            }
            state.discard_cancelled();
            let Some(deadline) = state.heap.peek().map(TimerEntry::next_due) else {
                // Nothing queued: sleep until an insertion (or shutdown) signals us.
                // Spurious wakeups simply loop back to the checks above.
                self.available.wait(&mut state);
                continue;
            };
            if deadline <= Instant::now() {
                // Due or overdue: no negative sleep, hand it out immediately
                return state.heap.pop();
            }
            // An insertion or wake_all cuts the wait short and the head is re-evaluated.
            self.available.wait_until(&mut state, deadline);
        }
    }

    /// Wake every thread blocked in [`TimerQueue::next_due`].
    pub fn wake_all(&self) {
        // Holding the lock orders this notify after any keep_running check in progress,
        // so the wakeup cannot slip in between that check and the wait.
        let _state = self.state.lock();
        self.available.notify_all();
    }

    /// Due time of the earliest live entry.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut state = self.state.lock();
        state.discard_cancelled();
        state.heap.peek().map(TimerEntry::next_due)
    }

    /// Number of queued entries, including cancelled ones not yet discarded.
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().heap.is_empty()
    }
}

impl<H> Default for TimerQueue<H> {
    fn default() -> Self {
        Self::new()
    }
}
