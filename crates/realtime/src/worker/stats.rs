//! Worker counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of what the worker has done since it was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Raw messages taken off the intake channel
    pub received: u64,

    /// Messages that did not parse into an event
    pub unparsed: u64,

    /// Events refused by validation or dedup
    pub rejected: u64,

    /// Events for streams nobody is subscribed to
    pub unrouted: u64,

    pub queued: u64,
    pub applied: u64,

    /// Events with no handler
    pub ignored: u64,

    /// Failed applies, redelivered or not
    pub failed: u64,

    pub retried: u64,
    pub dead_lettered: u64,
}

/// What one polling pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Streams visited
    pub streams: usize,

    /// Events taken off queues
    pub dispatched: usize,

    pub applied: usize,
    pub ignored: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

#[derive(Default)]
pub(crate) struct StatsCounters {
    pub received: AtomicU64,
    pub unparsed: AtomicU64,
    pub rejected: AtomicU64,
    pub unrouted: AtomicU64,
    pub queued: AtomicU64,
    pub applied: AtomicU64,
    pub ignored: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
}

impl StatsCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        WorkerStats {
            received: load(&self.received),
            unparsed: load(&self.unparsed),
            rejected: load(&self.rejected),
            unrouted: load(&self.unrouted),
            queued: load(&self.queued),
            applied: load(&self.applied),
            ignored: load(&self.ignored),
            failed: load(&self.failed),
            retried: load(&self.retried),
            dead_lettered: load(&self.dead_lettered),
        }
    }
}
