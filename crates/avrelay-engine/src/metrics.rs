//! Metrics collection and reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use avrelay_types::PipelineStats;
use parking_lot::RwLock;

use crate::STATS_INTERVAL_SECS;

/// Collects pipeline counters shared by the session threads.
pub struct MetricsCollector {
    start_time: RwLock<Option<Instant>>,
    units_in: AtomicU64,
    units_dropped: AtomicU64,
    units_out: AtomicU64,
    bytes_out: AtomicU64,
    buffer_stalls: AtomicU64,
    reconnects: AtomicU64,
    last_report_time: RwLock<Instant>,
    last_units_out: AtomicU64,
    last_bytes_out: AtomicU64,
    report_interval: Duration,
}

impl MetricsCollector {
    /// Create a collector reporting every `report_interval`.
    pub fn new(report_interval: Duration) -> Self {
        Self {
            start_time: RwLock::new(None),
            units_in: AtomicU64::new(0),
            units_dropped: AtomicU64::new(0),
            units_out: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            buffer_stalls: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_report_time: RwLock::new(Instant::now()),
            last_units_out: AtomicU64::new(0),
            last_bytes_out: AtomicU64::new(0),
            report_interval,
        }
    }

    /// Start metrics collection.
    pub fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
        *self.last_report_time.write() = Instant::now();
    }

    /// Stop metrics collection.
    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    /// Record a unit taken from the source.
    pub fn record_unit_in(&self) {
        self.units_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a unit dropped after a conversion or codec error.
    pub fn record_drop(&self) {
        self.units_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a unit delivered to the sink.
    pub fn record_unit_out(&self, bytes: usize) {
        self.units_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a producer stall. Returns the new total.
    pub fn record_stall(&self) -> u64 {
        self.buffer_stalls.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a reconnection. Returns the new total.
    pub fn record_reconnect(&self) -> u64 {
        self.reconnects.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns true once a report interval has passed since the last report.
    pub fn report_due(&self) -> bool {
        self.start_time.read().is_some() && self.last_report_time.read().elapsed() >= self.report_interval
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> PipelineStats {
        let elapsed = self.last_report_time.read().elapsed().as_secs_f32();

        let units_out = self.units_out.load(Ordering::Relaxed);
        let bytes_out = self.bytes_out.load(Ordering::Relaxed);
        let (rate, bitrate_kbps) = if elapsed > 0.0 {
            let units = units_out.saturating_sub(self.last_units_out.load(Ordering::Relaxed));
            let bytes = bytes_out.saturating_sub(self.last_bytes_out.load(Ordering::Relaxed));
            (
                units as f32 / elapsed,
                ((bytes * 8) as f32 / elapsed / 1000.0) as u32,
            )
        } else {
            (0.0, 0)
        };

        PipelineStats {
            units_in: self.units_in.load(Ordering::Relaxed),
            units_dropped: self.units_dropped.load(Ordering::Relaxed),
            units_out,
            bytes_out,
            buffer_stalls: self.buffer_stalls.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            rate,
            bitrate_kbps,
        }
    }

    /// Seconds since [`start`](Self::start).
    pub fn uptime(&self) -> Duration {
        self.start_time
            .read()
            .map(|s| s.elapsed())
            .unwrap_or_default()
    }

    /// Update last report time for rate calculation.
    pub fn mark_reported(&self) {
        *self.last_report_time.write() = Instant::now();
        self.last_units_out
            .store(self.units_out.load(Ordering::Relaxed), Ordering::Relaxed);
        self.last_bytes_out
            .store(self.bytes_out.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(Duration::from_secs(STATS_INTERVAL_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = MetricsCollector::default();
        metrics.start();
        metrics.record_unit_in();
        metrics.record_unit_in();
        metrics.record_drop();
        metrics.record_unit_out(100);
        assert_eq!(metrics.record_stall(), 1);
        assert_eq!(metrics.record_reconnect(), 1);

        let stats = metrics.snapshot();
        assert_eq!(stats.units_in, 2);
        assert_eq!(stats.units_dropped, 1);
        assert_eq!(stats.units_out, 1);
        assert_eq!(stats.bytes_out, 100);
        assert_eq!(stats.buffer_stalls, 1);
        assert_eq!(stats.reconnects, 1);
    }

    #[test]
    fn test_rate_resets_after_report() {
        let metrics = MetricsCollector::new(Duration::ZERO);
        assert!(!metrics.report_due());
        metrics.start();
        assert!(metrics.report_due());

        metrics.record_unit_out(10);
        std::thread::sleep(Duration::from_millis(10));
        assert!(metrics.snapshot().rate > 0.0);

        metrics.mark_reported();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(metrics.snapshot().rate, 0.0);
        assert_eq!(metrics.snapshot().units_out, 1);
    }
}
