//! Periodic timers: the entry type, caller handles, and the shared run queue.

pub mod entry;
pub mod queue;

pub use entry::{TimerEntry, TimerHandle, TimerId};
pub use queue::TimerQueue;
