#![forbid(unsafe_code)]

// Server metrics: lock-free AtomicU64 counters and Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Fixed histogram bucket boundaries (in microseconds for internal storage).
const BUCKET_BOUNDS_US: [u64; 8] = [
    100,        // 0.1ms
    500,        // 0.5ms
    1_000,      // 1ms
    5_000,      // 5ms
    10_000,     // 10ms
    50_000,     // 50ms
    100_000,    // 100ms
    1_000_000,  // 1s
];

const BUCKET_LABELS: [&str; 8] = ["0.0001", "0.0005", "0.001", "0.005", "0.01", "0.05", "0.1", "1"];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    /// bucket[i] counts observations <= BUCKET_BOUNDS_US[i]
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            if us <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (i, label) in BUCKET_LABELS.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Server-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    rooms_closed_total: AtomicU64,
    box_joins_total: AtomicU64,
    box_leaves_total: AtomicU64,
    box_rejections_total: AtomicU64,
    signals_relayed_total: AtomicU64,
    signals_dropped_total: AtomicU64,

    connections_active: AtomicU64,

    message_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                messages_received_total: AtomicU64::new(0),
                messages_sent_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                rooms_closed_total: AtomicU64::new(0),
                box_joins_total: AtomicU64::new(0),
                box_leaves_total: AtomicU64::new(0),
                box_rejections_total: AtomicU64::new(0),
                signals_relayed_total: AtomicU64::new(0),
                signals_dropped_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    // --- Counter increments ---

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_closed(&self) {
        self.inner.rooms_closed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_box_joins(&self) {
        self.inner.box_joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_box_leaves(&self) {
        self.inner.box_leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_box_rejections(&self) {
        self.inner.box_rejections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_signals_relayed(&self) {
        self.inner.signals_relayed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_signals_dropped(&self) {
        self.inner.signals_dropped_total.fetch_add(1, Relaxed);
    }

    // --- Gauge ---

    /// Increments connections_active and returns an RAII guard that decrements on drop.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    pub fn connections_active(&self) -> u64 {
        self.inner.connections_active.load(Relaxed)
    }

    // --- Histogram ---

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Render all metrics in Prometheus text exposition format.
    /// Room and occupancy gauges are sampled from the registry by the caller.
    pub fn render_prometheus(&self, rooms_active: usize, boxes_occupied: usize) -> String {
        let mut out = String::with_capacity(4096);

        let i = &self.inner;

        render_counter(&mut out, "boxroom_connections_total", "Total WebSocket connections", i.connections_total.load(Relaxed));
        render_counter(&mut out, "boxroom_messages_received_total", "Total messages received from clients", i.messages_received_total.load(Relaxed));
        render_counter(&mut out, "boxroom_messages_sent_total", "Total messages sent to clients", i.messages_sent_total.load(Relaxed));
        render_counter(&mut out, "boxroom_errors_total", "Total errors", i.errors_total.load(Relaxed));
        render_counter(&mut out, "boxroom_rooms_created_total", "Total rooms created", i.rooms_created_total.load(Relaxed));
        render_counter(&mut out, "boxroom_rooms_closed_total", "Total rooms ended or reaped", i.rooms_closed_total.load(Relaxed));
        render_counter(&mut out, "boxroom_box_joins_total", "Total accepted box joins", i.box_joins_total.load(Relaxed));
        render_counter(&mut out, "boxroom_box_leaves_total", "Total boxes vacated", i.box_leaves_total.load(Relaxed));
        render_counter(&mut out, "boxroom_box_rejections_total", "Total rejected box requests", i.box_rejections_total.load(Relaxed));
        render_counter(&mut out, "boxroom_signals_relayed_total", "Total offer/answer/ice messages relayed", i.signals_relayed_total.load(Relaxed));
        render_counter(&mut out, "boxroom_signals_dropped_total", "Total signals dropped for unknown targets", i.signals_dropped_total.load(Relaxed));

        render_gauge(&mut out, "boxroom_connections_active", "Currently active WebSocket connections", i.connections_active.load(Relaxed));
        render_gauge(&mut out, "boxroom_rooms_active", "Currently open rooms", rooms_active as u64);
        render_gauge(&mut out, "boxroom_boxes_occupied", "Currently occupied boxes", boxes_occupied as u64);

        i.message_handling.render(
            "boxroom_message_handling_seconds",
            "Message handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// RAII guard that decrements `connections_active` on drop.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_guard_restores_gauge() {
        let metrics = ServerMetrics::new();
        {
            let _a = metrics.connection_active_guard();
            let _b = metrics.connection_active_guard();
            assert_eq!(metrics.connections_active(), 2);
        }
        assert_eq!(metrics.connections_active(), 0);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let metrics = ServerMetrics::new();
        metrics.observe_message_handling(Duration::from_micros(50));
        metrics.observe_message_handling(Duration::from_millis(20));
        let out = metrics.render_prometheus(0, 0);
        assert!(out.contains("boxroom_message_handling_seconds_bucket{le=\"0.0001\"} 1"));
        assert!(out.contains("boxroom_message_handling_seconds_bucket{le=\"0.05\"} 2"));
        assert!(out.contains("boxroom_message_handling_seconds_bucket{le=\"+Inf\"} 2"));
        assert!(out.contains("boxroom_message_handling_seconds_sum 0.020050"));
    }

    #[test]
    fn test_render_includes_sampled_gauges() {
        let metrics = ServerMetrics::new();
        metrics.inc_box_joins();
        metrics.inc_box_joins();
        let out = metrics.render_prometheus(3, 5);
        assert!(out.contains("boxroom_box_joins_total 2"));
        assert!(out.contains("boxroom_rooms_active 3"));
        assert!(out.contains("boxroom_boxes_occupied 5"));
    }
}
