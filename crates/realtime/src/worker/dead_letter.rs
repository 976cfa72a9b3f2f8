//! Bounded store for events that could not be applied

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::event::Event;

/// An event that exhausted its deliveries
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: Uuid,
    pub event: Event,

    /// Last apply error
    pub error: String,

    /// Deliveries made, including the first
    pub attempts: u32,

    /// Whether the last error was transient
    pub retryable: bool,

    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(event: Event, error: impl Into<String>, retryable: bool) -> Self {
        Self {
            id: Uuid::now_v7(),
            attempts: event.attempt + 1,
            event,
            error: error.into(),
            retryable,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// FIFO of dead letters; the oldest is dropped when full
pub struct DeadLetterQueue {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetter>>,
    dropped: AtomicU64,
}

impl DeadLetterQueue {
    /// Create a queue holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            dropped: AtomicU64::new(0),
        }
    }

    /// Add an entry, returning the one evicted to make room
    pub fn push(&self, letter: DeadLetter) -> Option<DeadLetter> {
        if self.capacity == 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Some(letter);
        }

        let mut entries = self.entries.lock();
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };
        entries.push_back(letter);

        if let Some(old) = &evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(event_id = %old.event.event_id, "Dead letter queue full, dropping oldest entry");
        }
        evicted
    }

    /// Copy of the current entries, oldest first
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<DeadLetter> {
        self.entries.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries lost to the capacity bound
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
