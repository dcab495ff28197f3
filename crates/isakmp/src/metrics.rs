//! Metrics for SA management
//!
//! Counters and gauges for SA lifecycle, lookups and expirations. All
//! metrics use atomic operations; clones share the same counters.
//!
//! # Example
//!
//! ```
//! use fynx_isakmp::metrics::SaMetrics;
//!
//! let metrics = SaMetrics::new();
//! metrics.record_sa_created();
//! metrics.record_lookup(true);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.sa_active, 1);
//! assert_eq!(snapshot.lookup_hits, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// SA metrics for monitoring
#[derive(Debug, Clone)]
pub struct SaMetrics {
    /// SAs created
    pub sa_created: Arc<AtomicU64>,

    /// SAs torn down
    pub sa_freed: Arc<AtomicU64>,

    /// SAs currently alive
    pub sa_active: Arc<AtomicU64>,

    /// Explicit deletes
    pub sa_deleted: Arc<AtomicU64>,

    /// Keyed lookups that found an SA
    pub lookup_hits: Arc<AtomicU64>,

    /// Keyed lookups that found nothing
    pub lookup_misses: Arc<AtomicU64>,

    /// Soft expirations fired
    pub soft_expirations: Arc<AtomicU64>,

    /// Hard expirations fired
    pub hard_expirations: Arc<AtomicU64>,

    /// Renegotiations requested
    pub rekeys: Arc<AtomicU64>,

    /// Expiry timers armed
    pub timers_armed: Arc<AtomicU64>,

    /// Expiry timers that could not be armed
    pub timer_failures: Arc<AtomicU64>,

    /// Offers that yielded no acceptable proposal
    pub proposals_rejected: Arc<AtomicU64>,

    /// DELETE notifications sent
    pub deletes_sent: Arc<AtomicU64>,

    /// Table resizes
    pub table_resizes: Arc<AtomicU64>,
}

impl SaMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self {
            sa_created: Arc::new(AtomicU64::new(0)),
            sa_freed: Arc::new(AtomicU64::new(0)),
            sa_active: Arc::new(AtomicU64::new(0)),
            sa_deleted: Arc::new(AtomicU64::new(0)),
            lookup_hits: Arc::new(AtomicU64::new(0)),
            lookup_misses: Arc::new(AtomicU64::new(0)),
            soft_expirations: Arc::new(AtomicU64::new(0)),
            hard_expirations: Arc::new(AtomicU64::new(0)),
            rekeys: Arc::new(AtomicU64::new(0)),
            timers_armed: Arc::new(AtomicU64::new(0)),
            timer_failures: Arc::new(AtomicU64::new(0)),
            proposals_rejected: Arc::new(AtomicU64::new(0)),
            deletes_sent: Arc::new(AtomicU64::new(0)),
            table_resizes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record SA created
    pub fn record_sa_created(&self) {
        self.sa_created.fetch_add(1, Ordering::Relaxed);
        self.sa_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record SA torn down
    pub fn record_sa_freed(&self) {
        self.sa_freed.fetch_add(1, Ordering::Relaxed);
        self.sa_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record explicit delete
    pub fn record_sa_deleted(&self) {
        self.sa_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record keyed lookup
    pub fn record_lookup(&self, hit: bool) {
        if hit {
            self.lookup_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.lookup_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record soft expiration
    pub fn record_soft_expired(&self) {
        self.soft_expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record hard expiration
    pub fn record_hard_expired(&self) {
        self.hard_expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record renegotiation request
    pub fn record_rekey(&self) {
        self.rekeys.fetch_add(1, Ordering::Relaxed);
    }

    /// Record expiry timer armed
    pub fn record_timer_armed(&self) {
        self.timers_armed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record expiry timer registration failure
    pub fn record_timer_failure(&self) {
        self.timer_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record offer without acceptable proposal
    pub fn record_proposal_rejected(&self) {
        self.proposals_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record DELETE sent
    pub fn record_delete_sent(&self) {
        self.deletes_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record table resize
    pub fn record_table_resize(&self) {
        self.table_resizes.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    ///
    /// Values may be slightly inconsistent across metrics due to concurrent updates.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sa_created: self.sa_created.load(Ordering::Relaxed),
            sa_freed: self.sa_freed.load(Ordering::Relaxed),
            sa_active: self.sa_active.load(Ordering::Relaxed),
            sa_deleted: self.sa_deleted.load(Ordering::Relaxed),
            lookup_hits: self.lookup_hits.load(Ordering::Relaxed),
            lookup_misses: self.lookup_misses.load(Ordering::Relaxed),
            soft_expirations: self.soft_expirations.load(Ordering::Relaxed),
            hard_expirations: self.hard_expirations.load(Ordering::Relaxed),
            rekeys: self.rekeys.load(Ordering::Relaxed),
            timers_armed: self.timers_armed.load(Ordering::Relaxed),
            timer_failures: self.timer_failures.load(Ordering::Relaxed),
            proposals_rejected: self.proposals_rejected.load(Ordering::Relaxed),
            deletes_sent: self.deletes_sent.load(Ordering::Relaxed),
            table_resizes: self.table_resizes.load(Ordering::Relaxed),
        }
    }
}

impl Default for SaMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all SA metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
    /// SAs created
    pub sa_created: u64,

    /// SAs torn down
    pub sa_freed: u64,

    /// SAs currently alive
    pub sa_active: u64,

    /// Explicit deletes
    pub sa_deleted: u64,

    /// Keyed lookups that found an SA
    pub lookup_hits: u64,

    /// Keyed lookups that found nothing
    pub lookup_misses: u64,

    /// Soft expirations fired
    pub soft_expirations: u64,

    /// Hard expirations fired
    pub hard_expirations: u64,

    /// Renegotiations requested
    pub rekeys: u64,

    /// Expiry timers armed
    pub timers_armed: u64,

    /// Expiry timers that could not be armed
    pub timer_failures: u64,

    /// Offers that yielded no acceptable proposal
    pub proposals_rejected: u64,

    /// DELETE notifications sent
    pub deletes_sent: u64,

    /// Table resizes
    pub table_resizes: u64,
}

impl MetricsSnapshot {
    /// Fraction of keyed lookups that hit (0.0 to 1.0)
    pub fn lookup_hit_rate(&self) -> f64 {
        let total = self.lookup_hits + self.lookup_misses;
        if total == 0 {
            return 0.0;
        }
        self.lookup_hits as f64 / total as f64
    }
}
