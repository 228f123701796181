//! Control-plane metrics
//!
//! Prometheus-compatible counters for the events operators page on:
//! - discovery lookups and barrier failures
//! - quorum queries, failovers requested/completed/timed out
//! - objectively-down transitions seen by the local agent
//! - probe outcomes and handover wait times

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bucket boundaries for handover waits (in seconds)
const WAIT_BUCKETS: [f64; 8] = [0.5, 1.0, 2.0, 5.0, 10.0, 15.0, 20.0, 30.0];

/// A simple histogram implementation for wait tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum_millis: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&WAIT_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        Self {
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: boundaries.to_vec(),
            sum_millis: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let secs = value.as_secs_f64();
        let idx = self
            .boundaries
            .iter()
            .position(|&b| secs <= b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_millis
            .fetch_add(value.as_millis() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative buckets, ending with +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);
        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }
        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));
        result
    }

    pub fn sum_seconds(&self) -> f64 {
        self.sum_millis.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    pub dns_lookups: Counter,
    pub dns_failures: Counter,
    pub master_queries: Counter,
    pub failovers_requested: Counter,
    pub failovers_completed: Counter,
    pub failovers_timed_out: Counter,
    pub odown_transitions: Counter,
    pub promotions: Counter,
    pub probes_ok: Counter,
    pub probes_failed: Counter,

    /// Current configuration epoch of the local agent
    pub epoch: Gauge,
    pub known_sentinels: Gauge,
    pub known_replicas: Gauge,

    pub handover_wait: Histogram,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            dns_lookups: Counter::new(),
            dns_failures: Counter::new(),
            master_queries: Counter::new(),
            failovers_requested: Counter::new(),
            failovers_completed: Counter::new(),
            failovers_timed_out: Counter::new(),
            odown_transitions: Counter::new(),
            promotions: Counter::new(),
            probes_ok: Counter::new(),
            probes_failed: Counter::new(),
            epoch: Gauge::new(),
            known_sentinels: Gauge::new(),
            known_replicas: Gauge::new(),
            handover_wait: Histogram::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 10] = [
            ("dns_lookups_total", "Discovery lookups", &self.dns_lookups),
            ("dns_failures_total", "Failed discovery lookups", &self.dns_failures),
            ("master_queries_total", "Who-is-master queries", &self.master_queries),
            ("failovers_requested_total", "Manual failovers requested", &self.failovers_requested),
            ("failovers_completed_total", "Failovers confirmed", &self.failovers_completed),
            ("failovers_timed_out_total", "Handovers that timed out", &self.failovers_timed_out),
            ("odown_transitions_total", "Objectively-down transitions", &self.odown_transitions),
            ("promotions_total", "Replicas promoted by this agent", &self.promotions),
            ("probes_ok_total", "Passing health probes", &self.probes_ok),
            ("probes_failed_total", "Failing health probes", &self.probes_failed),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP kvsentinel_{} {}", name, help);
            let _ = writeln!(out, "# TYPE kvsentinel_{} counter", name);
            let _ = writeln!(out, "kvsentinel_{} {}", name, counter.get());
        }

        let gauges: [(&str, &str, u64); 4] = [
            ("epoch", "Configuration epoch", self.epoch.get()),
            ("known_sentinels", "Known peer monitors", self.known_sentinels.get()),
            ("known_replicas", "Known replicas", self.known_replicas.get()),
            ("uptime_seconds", "Process uptime in seconds", self.uptime_seconds()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP kvsentinel_{} {}", name, help);
            let _ = writeln!(out, "# TYPE kvsentinel_{} gauge", name);
            let _ = writeln!(out, "kvsentinel_{} {}", name, value);
        }

        out.push_str("# HELP kvsentinel_handover_wait_seconds Graceful handover wait\n");
        out.push_str("# TYPE kvsentinel_handover_wait_seconds histogram\n");
        for (le, count) in self.handover_wait.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "kvsentinel_handover_wait_seconds_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "kvsentinel_handover_wait_seconds_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(
            out,
            "kvsentinel_handover_wait_seconds_sum {}",
            self.handover_wait.sum_seconds()
        );
        let _ = writeln!(
            out,
            "kvsentinel_handover_wait_seconds_count {}",
            self.handover_wait.count()
        );

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
