//! # Metrics
//!
//! Lock-free operation counters for monitoring. The wire surfaces render a
//! [`MetricsSnapshot`] when the metrics endpoint is enabled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    sets: AtomicU64,
    set_nx: AtomicU64,
    gets_found: AtomicU64,
    gets_missed: AtomicU64,
    deletes: AtomicU64,
    increments: AtomicU64,
    conflicts: AtomicU64,
    rejected_overload: AtomicU64,
    rejected_unauthorized: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_set(&self) {
        self.inner.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set_nx(&self) {
        self.inner.set_nx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get(&self, found: bool) {
        if found {
            self.inner.gets_found.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.gets_missed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_delete(&self) {
        self.inner.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_increment(&self) {
        self.inner.increments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.inner.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overload(&self) {
        self.inner.rejected_overload.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unauthorized(&self) {
        self.inner
            .rejected_unauthorized
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sets: self.inner.sets.load(Ordering::Relaxed),
            set_nx: self.inner.set_nx.load(Ordering::Relaxed),
            gets_found: self.inner.gets_found.load(Ordering::Relaxed),
            gets_missed: self.inner.gets_missed.load(Ordering::Relaxed),
            deletes: self.inner.deletes.load(Ordering::Relaxed),
            increments: self.inner.increments.load(Ordering::Relaxed),
            conflicts: self.inner.conflicts.load(Ordering::Relaxed),
            rejected_overload: self.inner.rejected_overload.load(Ordering::Relaxed),
            rejected_unauthorized: self.inner.rejected_unauthorized.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of all counters
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub sets: u64,
    pub set_nx: u64,
    pub gets_found: u64,
    pub gets_missed: u64,
    pub deletes: u64,
    pub increments: u64,
    pub conflicts: u64,
    pub rejected_overload: u64,
    pub rejected_unauthorized: u64,
}

impl MetricsSnapshot {
    /// Render in the plain text exposition format scrapers expect.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(512);
        let mut line = |name: &str, op: &str, v: u64| {
            out.push_str(&format!("tanto_{name}{{op=\"{op}\"}} {v}\n"));
        };
        line("operations_total", "set", self.sets);
        line("operations_total", "setnx", self.set_nx);
        line("operations_total", "get_found", self.gets_found);
        line("operations_total", "get_missed", self.gets_missed);
        line("operations_total", "del", self.deletes);
        line("operations_total", "incr", self.increments);
        line("rejections_total", "conflict", self.conflicts);
        line("rejections_total", "overload", self.rejected_overload);
        line("rejections_total", "unauthorized", self.rejected_unauthorized);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let m = Metrics::new();
        m.record_set();
        m.record_set();
        m.record_get(true);
        m.record_get(false);
        m.record_conflict();

        let s = m.snapshot();
        assert_eq!(s.sets, 2);
        assert_eq!(s.gets_found, 1);
        assert_eq!(s.gets_missed, 1);
        assert_eq!(s.conflicts, 1);
    }

    #[test]
    fn test_render_contains_all_ops() {
        let m = Metrics::new();
        m.record_increment();
        let text = m.snapshot().render();
        assert!(text.contains("tanto_operations_total{op=\"incr\"} 1"));
        assert!(text.contains("tanto_rejections_total{op=\"overload\"} 0"));
    }
}
