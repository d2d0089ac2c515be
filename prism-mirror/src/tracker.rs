//! Tracking of paths the engine mutated itself.
//!
//! Every write the engine performs into the master tree or a peer mirror
//! comes back around as a filesystem notification. The tracker is the
//! write-ahead marker that lets the coordinator recognize those echoes and
//! discard them instead of re-propagating forever. It is a pure in-memory
//! cache, bounded in population and in time, and never a source of truth
//! about the filesystem.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bounded, time-expiring record of self-caused filesystem paths.
///
/// Thread-safe; shared between the replicator (which records) and the
/// coordinator (which queries).
pub struct PathTracker {
    /// Tracked paths with their recording time
    entries: DashMap<PathBuf, Instant>,

    /// Insertion-order queue for capacity eviction
    queue: RwLock<VecDeque<PathBuf>>,

    /// Maximum tracked paths before the oldest are evicted
    max_entries: usize,

    /// Time after which a recorded path no longer suppresses events
    ttl: Duration,

    /// Tracker statistics
    stats: TrackerCounters,
}

impl PathTracker {
    /// Create a new tracker with the given population bound and TTL.
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            queue: RwLock::new(VecDeque::new()),
            max_entries,
            ttl,
            stats: TrackerCounters::new(),
        }
    }

    /// Create a tracker from configuration.
    pub fn from_config(config: &prism_core::TrackerConfig) -> Self {
        Self::new(config.max_entries, config.ttl())
    }

    /// Mark a path as about to be mutated by the engine.
    ///
    /// Call this before the filesystem operation so the notification can
    /// never outrun the marker. Re-recording refreshes the entry.
    pub fn record(&self, path: &Path) {
        self.evict_if_full();

        let refreshed = self
            .entries
            .insert(path.to_path_buf(), Instant::now())
            .is_some();

        let mut queue = self.queue.write();
        if refreshed {
            if let Some(pos) = queue.iter().position(|p| p == path) {
                queue.remove(pos);
            }
        }
        queue.push_back(path.to_path_buf());

        self.stats.records.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether this path was recently mutated by the engine itself.
    ///
    /// Expired entries are removed lazily and reported untracked. A hit does
    /// not consume the entry: one propagated write can surface as several
    /// notifications (parent directory plus object), and each must be
    /// suppressed.
    pub fn is_tracked(&self, path: &Path) -> bool {
        let recorded_at = self.entries.get(path).map(|entry| *entry.value());

        match recorded_at {
            Some(at) if at.elapsed() <= self.ttl => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(_) => {
                self.remove(path);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Drop the marker for a write that did not happen after all.
    ///
    /// Counterpart to the record-before-write discipline: a collision or a
    /// failed mutation produces no notification, and leaving the marker in
    /// place would suppress a genuine future event on the same path.
    pub fn forget(&self, path: &Path) {
        self.remove(path);
    }

    /// Number of currently tracked paths (including not-yet-expired ones).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no paths are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of tracker statistics.
    pub fn stats(&self) -> TrackerStats {
        self.stats.snapshot()
    }

    fn remove(&self, path: &Path) {
        if self.entries.remove(path).is_some() {
            let mut queue = self.queue.write();
            if let Some(pos) = queue.iter().position(|p| p == path) {
                queue.remove(pos);
            }
        }
    }

    fn evict_if_full(&self) {
        while self.entries.len() >= self.max_entries {
            let oldest = self.queue.write().pop_front();
            match oldest {
                Some(path) => {
                    self.entries.remove(&path);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }
}

/// Internal atomic counters.
struct TrackerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    records: AtomicU64,
    evictions: AtomicU64,
}

impl TrackerCounters {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            records: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> TrackerStats {
        TrackerStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of tracker statistics.
#[derive(Debug, Clone, Copy)]
pub struct TrackerStats {
    pub hits: u64,
    pub misses: u64,
    pub records: u64,
    pub evictions: u64,
}
