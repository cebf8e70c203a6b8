use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Snapshot of request counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStats {
    /// Requests parsed and handed to the core
    pub received: u64,
    /// Requests that completed the full lifecycle
    pub replied: u64,
    /// Requests that ended early (malformed, hook stop, rate limit, forward failure)
    pub aborted: u64,
    /// Outbound failures (connect, timeout, TLS, upstream proxy)
    pub forward_errors: u64,
    /// Hook failures (panics and errors), never surfaced to clients
    pub hook_errors: u64,
    /// Identities evicted after repeated failures
    pub evictions: u64,
    /// Requests dropped because the client disconnected
    pub cancelled: u64,
    /// Timestamp when the tracker was created (Unix timestamp)
    pub start_time: u64,
}

/// Statistics tracker shared by every connection task
#[derive(Debug, Clone)]
pub struct StatsTracker {
    received: Arc<AtomicU64>,
    replied: Arc<AtomicU64>,
    aborted: Arc<AtomicU64>,
    forward_errors: Arc<AtomicU64>,
    hook_errors: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
    cancelled: Arc<AtomicU64>,
    start_time: u64,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            received: Arc::new(AtomicU64::new(0)),
            replied: Arc::new(AtomicU64::new(0)),
            aborted: Arc::new(AtomicU64::new(0)),
            forward_errors: Arc::new(AtomicU64::new(0)),
            hook_errors: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
            cancelled: Arc::new(AtomicU64::new(0)),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    pub fn request_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_replied(&self) {
        self.replied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn forward_error(&self) {
        self.forward_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Add hook failures observed while running a pipeline stage
    pub fn add_hook_errors(&self, count: usize) {
        self.hook_errors.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn identity_evicted(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of stats
    pub fn get_stats(&self) -> ProxyStats {
        ProxyStats {
            received: self.received.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            forward_errors: self.forward_errors.load(Ordering::Relaxed),
            hook_errors: self.hook_errors.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}
