//! Prometheus metrics
//!
//! Process-wide counters, gauges and histograms, rendered in the text
//! exposition format by `GET /metrics`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic counter
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {name} {}\n# TYPE {name} counter\n{name} {}\n",
            self.help,
            self.get(),
            name = self.name
        )
    }
}

/// Gauge that can move both ways
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {name} {}\n# TYPE {name} gauge\n{name} {}\n",
            self.help,
            self.get(),
            name = self.name
        )
    }
}

/// Latency histogram in seconds
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Histogram {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self::with_buckets(
            name,
            help,
            &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        )
    }

    pub fn with_buckets(name: &'static str, help: &'static str, bounds: &[f64]) -> Self {
        Self {
            buckets: bounds.iter().map(|b| (*b, AtomicU64::new(0))).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn observe(&self, seconds: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);

        // Buckets are cumulative
        for (bound, count) in &self.buckets {
            if seconds <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record the time since `start`
    pub fn observe_since(&self, start: Instant) {
        self.observe(start.elapsed().as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {name} {}\n# TYPE {name} histogram\n",
            self.help,
            name = self.name
        );

        for (bound, count) in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", self.name, self.count()));

        let sum_secs = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!("{}_count {}\n", self.name, self.count()));
        output
    }
}

/// Cluster metrics shared by every component in the process
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static REGISTERED_RANKS: Gauge =
        Gauge::new("dpserve_registered_ranks", "Ranks registered with the head coordinator");

    pub static ROUTABLE_SHARDS: Gauge =
        Gauge::new("dpserve_routable_shards", "Shards currently eligible for routing");

    pub static INFLIGHT_REQUESTS: Gauge =
        Gauge::new("dpserve_inflight_requests", "Shard calls currently in flight");

    pub static WEIGHT_VERSION: Gauge =
        Gauge::new("dpserve_weight_version", "Weight version acknowledged by every rank");

    pub static REQUESTS_ROUTED: Counter =
        Counter::new("dpserve_requests_routed_total", "Requests routed to a shard");

    pub static REQUEST_RETRIES: Counter =
        Counter::new("dpserve_request_retries_total", "Requests retried on a second shard");

    pub static REQUEST_FAILURES: Counter =
        Counter::new("dpserve_request_failures_total", "Requests that returned an error");

    pub static BROADCAST_RETRIES: Counter =
        Counter::new("dpserve_broadcast_retries_total", "Sealed table broadcast attempts that were retried");

    pub static ROUTE_LATENCY: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("dpserve_route_duration_seconds", "End-to-end dispatch latency")
    });
}

/// Render every standard metric
pub fn gather_system_metrics() -> String {
    let mut output = String::new();

    output.push_str(&standard::REQUESTS_ROUTED.to_prometheus());
    output.push_str(&standard::REQUEST_RETRIES.to_prometheus());
    output.push_str(&standard::REQUEST_FAILURES.to_prometheus());
    output.push_str(&standard::BROADCAST_RETRIES.to_prometheus());

    output.push_str(&standard::REGISTERED_RANKS.to_prometheus());
    output.push_str(&standard::ROUTABLE_SHARDS.to_prometheus());
    output.push_str(&standard::INFLIGHT_REQUESTS.to_prometheus());
    output.push_str(&standard::WEIGHT_VERSION.to_prometheus());

    output.push_str(&standard::ROUTE_LATENCY.to_prometheus());
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "Test counter");
        counter.inc();
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
        assert!(counter.to_prometheus().contains("test_counter 6"));
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("test_gauge", "Test gauge");
        gauge.set(10);
        gauge.dec();
        assert_eq!(gauge.get(), 9);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::with_buckets("test_histogram", "Test histogram", &[0.01, 1.0]);
        histogram.observe(0.001);
        histogram.observe(0.5);
        histogram.observe(3.0);

        let text = histogram.to_prometheus();
        assert!(text.contains("test_histogram_bucket{le=\"0.01\"} 1"));
        assert!(text.contains("test_histogram_bucket{le=\"1\"} 2"));
        assert!(text.contains("test_histogram_bucket{le=\"+Inf\"} 3"));
        assert!(text.contains("test_histogram_count 3"));
    }

    #[test]
    fn test_gather_includes_standard_metrics() {
        let text = gather_system_metrics();
        assert!(text.contains("dpserve_requests_routed_total"));
        assert!(text.contains("dpserve_route_duration_seconds_count"));
    }
}
