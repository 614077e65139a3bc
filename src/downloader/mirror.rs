/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 */

//! Mirror pool bounding concurrent transfers per origin and overall.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Pool key for a URI: `scheme://host[:port]`
pub fn mirror_origin(uri: &str) -> String {
    match url::Url::parse(uri) {
        Ok(url) => match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}://{}:{}", url.scheme(), host, port),
            (Some(host), None) => format!("{}://{}", url.scheme(), host),
            _ => uri.to_string(),
        },
        Err(_) => uri.to_string(),
    }
}

/// Transfer statistics for one mirror
#[derive(Debug)]
pub struct MirrorStats {
    pub origin: String,
    bytes_downloaded: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_time_ms: AtomicU64,
}

impl MirrorStats {
    fn new(origin: String) -> Self {
        Self {
            origin,
            bytes_downloaded: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_time_ms: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self, bytes: u64, time_ms: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.total_time_ms.fetch_add(time_ms, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes per second (0 if no data)
    pub fn throughput(&self) -> u64 {
        let bytes = self.bytes_downloaded.load(Ordering::Relaxed);
        let time_ms = self.total_time_ms.load(Ordering::Relaxed);
        if time_ms == 0 {
            return 0;
        }
        (bytes * 1000) / time_ms
    }

    pub fn snapshot(&self) -> MirrorStatsSnapshot {
        MirrorStatsSnapshot {
            origin: self.origin.clone(),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bytes: self.bytes_downloaded.load(Ordering::Relaxed),
            throughput: self.throughput(),
        }
    }
}

/// Point-in-time copy of [`MirrorStats`] for reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorStatsSnapshot {
    pub origin: String,
    pub successes: u64,
    pub failures: u64,
    pub bytes: u64,
    pub throughput: u64,
}

#[derive(Debug, Default)]
struct Counters {
    active: HashMap<String, usize>,
    total: usize,
}

/// Registry of live transfers per mirror origin
///
/// All counter mutation happens under one mutex. Acquiring never blocks on
/// capacity: callers poll and reschedule.
#[derive(Debug)]
pub struct MirrorPool {
    per_mirror_limit: usize,
    global_limit: usize,
    counters: Mutex<Counters>,
    stats: Mutex<HashMap<String, Arc<MirrorStats>>>,
}

impl MirrorPool {
    pub fn new(per_mirror_limit: usize, global_limit: usize) -> Self {
        Self {
            per_mirror_limit,
            global_limit,
            counters: Mutex::new(Counters::default()),
            stats: Mutex::new(HashMap::new()),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve one slot for `mirror`, returning false when saturated
    pub fn try_acquire(&self, mirror: &str) -> bool {
        let mut counters = self.counters();
        if counters.total >= self.global_limit {
            return false;
        }
        let active = counters.active.get(mirror).copied().unwrap_or(0);
        if active >= self.per_mirror_limit {
            return false;
        }
        counters.active.insert(mirror.to_string(), active + 1);
        counters.total += 1;
        true
    }

    /// Give back a slot taken by [`MirrorPool::try_acquire`]
    pub fn release(&self, mirror: &str) {
        let mut counters = self.counters();
        let remaining = match counters.active.get_mut(mirror) {
            Some(active) => {
                *active = active.saturating_sub(1);
                *active
            }
            None => return,
        };
        if remaining == 0 {
            counters.active.remove(mirror);
        }
        counters.total = counters.total.saturating_sub(1);
    }

    /// Like [`MirrorPool::try_acquire`] but released when the guard drops
    pub fn try_slot(self: &Arc<Self>, mirror: &str) -> Option<MirrorSlot> {
        if self.try_acquire(mirror) {
            Some(MirrorSlot {
                pool: Arc::clone(self),
                mirror: mirror.to_string(),
            })
        } else {
            None
        }
    }

    /// Whether a slot for `mirror` is currently free
    pub fn has_capacity(&self, mirror: &str) -> bool {
        let counters = self.counters();
        counters.total < self.global_limit
            && counters.active.get(mirror).copied().unwrap_or(0) < self.per_mirror_limit
    }

    pub fn active(&self, mirror: &str) -> usize {
        self.counters().active.get(mirror).copied().unwrap_or(0)
    }

    pub fn total_active(&self) -> usize {
        self.counters().total
    }

    /// Statistics handle for `mirror`, created on first use
    pub fn stats(&self, mirror: &str) -> Arc<MirrorStats> {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            stats
                .entry(mirror.to_string())
                .or_insert_with(|| Arc::new(MirrorStats::new(mirror.to_string()))),
        )
    }

    /// Snapshots of every mirror seen so far, sorted by origin
    pub fn snapshot(&self) -> Vec<MirrorStatsSnapshot> {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let mut snapshots: Vec<_> = stats.values().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.origin.cmp(&b.origin));
        snapshots
    }
}

/// Scoped reservation in a [`MirrorPool`]
#[derive(Debug)]
pub struct MirrorSlot {
    pool: Arc<MirrorPool>,
    mirror: String,
}

impl MirrorSlot {
    pub fn mirror(&self) -> &str {
        &self.mirror
    }
}

impl Drop for MirrorSlot {
    fn drop(&mut self) {
        self.pool.release(&self.mirror);
    }
}
