//! Bounded cache of seen event ids
//!
//! Ids are stored in a ring of time buckets. A bucket is opened every
//! `ttl / bucket_count`. A bucket is dropped one `ttl` after its newest
//! insert, so an id is remembered for at least `ttl` and at most one bucket
//! width longer. The oldest bucket is dropped early once `max_entries` is
//! reached. Lookups scan at most `bucket_count + 1` hash sets.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::reliability::duration_millis;

/// Dedup cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DedupConfig {
    /// How long an id is remembered
    #[serde(with = "duration_millis")]
    pub ttl: Duration,

    /// Number of time buckets the ttl is split into
    pub bucket_count: usize,

    /// Hard cap on remembered ids
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            bucket_count: 12,
            max_entries: 100_000,
        }
    }
}

impl DedupConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ttl
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the number of buckets
    pub fn with_bucket_count(mut self, count: usize) -> Self {
        self.bucket_count = count.max(1);
        self
    }

    /// Set the entry cap
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.max(1);
        self
    }

    fn bucket_width(&self) -> Duration {
        let count = u32::try_from(self.bucket_count.max(1)).unwrap_or(u32::MAX);
        (self.ttl / count).max(Duration::from_millis(1))
    }
}

struct Bucket {
    opened_at: Instant,
    /// Most recent insert; the bucket expires one ttl later
    newest_at: Instant,
    ids: HashSet<String>,
}

#[derive(Default)]
struct Ring {
    buckets: VecDeque<Bucket>,
    len: usize,
}

impl Ring {
    fn evict_front(&mut self) {
        if let Some(bucket) = self.buckets.pop_front() {
            self.len -= bucket.ids.len();
        }
    }
}

/// Time-bucketed set of seen event ids
pub struct DedupCache {
    config: DedupConfig,
    ring: Mutex<Ring>,
}

impl DedupCache {
    /// Create an empty cache
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            ring: Mutex::new(Ring::default()),
        }
    }

    /// Record `id`, returning `true` if it was already present
    pub fn check_and_insert(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut ring = self.ring.lock();

        self.expire(&mut ring, now);

        if ring.buckets.iter().any(|bucket| bucket.ids.contains(id)) {
            return true;
        }

        while ring.len >= self.config.max_entries && !ring.buckets.is_empty() {
            ring.evict_front();
        }

        let width = self.config.bucket_width();
        let needs_bucket = ring
            .buckets
            .back()
            .map_or(true, |bucket| bucket.opened_at + width <= now);
        if needs_bucket {
            ring.buckets.push_back(Bucket {
                opened_at: now,
                newest_at: now,
                ids: HashSet::new(),
            });
        }

        if let Some(bucket) = ring.buckets.back_mut() {
            bucket.newest_at = now;
            bucket.ids.insert(id.to_string());
            ring.len += 1;
        }

        false
    }

    /// Whether `id` is currently remembered
    pub fn contains(&self, id: &str) -> bool {
        let mut ring = self.ring.lock();
        self.expire(&mut ring, Instant::now());
        ring.buckets.iter().any(|bucket| bucket.ids.contains(id))
    }

    /// Number of remembered ids
    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live buckets
    pub fn bucket_count(&self) -> usize {
        self.ring.lock().buckets.len()
    }

    fn expire(&self, ring: &mut Ring, now: Instant) {
        while ring
            .buckets
            .front()
            .is_some_and(|bucket| bucket.newest_at + self.config.ttl <= now)
        {
            ring.evict_front();
        }
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}
