// ===============================
// src/metrics.rs
// ===============================
use ahash::AHashMap as HashMap;
use parking_lot::{Mutex, RwLock};
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::warn;

// Nama counter / distribusi yang dipakai pipeline
pub const ORDERS_RECEIVED: &str = "orders_received";
pub const ORDERS_SUCCESS: &str = "orders_success";
pub const ORDERS_FAILED: &str = "orders_failed";
pub const ORDERS_DISPATCH_REJECTED: &str = "orders_dispatch_rejected";
pub const ORDERS_PROCESSING_FAULTS: &str = "orders_processing_faults";
pub const ORDERS_PROCESSING_INTERRUPTED: &str = "orders_processing_interrupted";
pub const ORDER_PROCESSING_DURATION: &str = "order_processing_duration";

// Pool gauges
pub const POOL_WORKERS: &str = "order_pool_workers";
pub const POOL_IN_FLIGHT: &str = "order_pool_in_flight";
pub const POOL_QUEUED: &str = "order_pool_queued";

const QUANTILES: [f64; 2] = [0.5, 0.95];

/// Sink untuk counter, durasi, dan gauge. Semua method harus aman dipanggil
/// paralel dari semua worker.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str);
    fn record_duration(&self, name: &str, elapsed: Duration);
    fn read_counter(&self, name: &str) -> u64;

    fn set_gauge(&self, _name: &str, _value: i64) {}

    fn duration_summary(&self, _name: &str) -> Option<DurationSummary> { None }
}

/// Ringkasan distribusi durasi dari sampel terbaru.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationSummary {
    pub count: u64,
    pub p50: Duration,
    pub p95: Duration,
    pub max: Duration,
}

/// Sliding window sampel (FIFO), dipakai untuk hitung persentil.
#[derive(Debug)]
pub struct SampleWindow {
    window: VecDeque<Duration>,
    cap: usize,
    total: u64,
}

impl SampleWindow {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self { window: VecDeque::with_capacity(cap), cap, total: 0 }
    }

    pub fn push(&mut self, d: Duration) {
        if self.window.len() == self.cap {
            self.window.pop_front();
        }
        self.window.push_back(d);
        self.total += 1;
    }

    pub fn summary(&self) -> Option<DurationSummary> {
        if self.window.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.window.iter().copied().collect();
        sorted.sort_unstable();
        Some(DurationSummary {
            count: self.total,
            p50: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
            max: sorted[sorted.len() - 1],
        })
    }
}

// nearest-rank pada slice yang sudah terurut
fn percentile(sorted: &[Duration], q: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

struct DurationMetric {
    hist: Histogram,
    quantiles: GaugeVec,
    window: Mutex<SampleWindow>,
}

/// Implementasi `MetricsSink` di atas registry prometheus milik instance ini.
pub struct Metrics {
    registry: Registry,
    window_cap: usize,
    counters: RwLock<HashMap<String, IntCounter>>,
    durations: RwLock<HashMap<String, DurationMetric>>,
    gauges: RwLock<HashMap<String, IntGauge>>,
}

impl Metrics {
    pub fn new(window_cap: usize) -> Self {
        let m = Self {
            registry: Registry::new(),
            window_cap,
            counters: RwLock::new(HashMap::new()),
            durations: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
        };
        // Daftarkan di awal supaya langsung muncul (nilai 0) di /metrics
        for name in [
            ORDERS_RECEIVED,
            ORDERS_SUCCESS,
            ORDERS_FAILED,
            ORDERS_DISPATCH_REJECTED,
            ORDERS_PROCESSING_FAULTS,
            ORDERS_PROCESSING_INTERRUPTED,
        ] {
            m.counter(name);
        }
        m.with_duration(ORDER_PROCESSING_DURATION, |_| ());
        for name in [POOL_WORKERS, POOL_IN_FLIGHT, POOL_QUEUED] {
            m.gauge(name);
        }
        m
    }

    fn counter(&self, name: &str) -> Option<IntCounter> {
        if let Some(c) = self.counters.read().get(name) {
            return Some(c.clone());
        }
        let mut map = self.counters.write();
        if let Some(c) = map.get(name) {
            return Some(c.clone());
        }
        let c = match IntCounter::new(format!("{name}_total"), format!("{name} events")) {
            Ok(c) => c,
            Err(e) => {
                warn!(?e, %name, "metrics: invalid counter");
                return None;
            }
        };
        if let Err(e) = self.registry.register(Box::new(c.clone())) {
            warn!(?e, %name, "metrics: register counter failed");
        }
        map.insert(name.to_string(), c.clone());
        Some(c)
    }

    fn gauge(&self, name: &str) -> Option<IntGauge> {
        if let Some(g) = self.gauges.read().get(name) {
            return Some(g.clone());
        }
        let mut map = self.gauges.write();
        if let Some(g) = map.get(name) {
            return Some(g.clone());
        }
        let g = match IntGauge::new(name, format!("{name} (gauge)")) {
            Ok(g) => g,
            Err(e) => {
                warn!(?e, %name, "metrics: invalid gauge");
                return None;
            }
        };
        if let Err(e) = self.registry.register(Box::new(g.clone())) {
            warn!(?e, %name, "metrics: register gauge failed");
        }
        map.insert(name.to_string(), g.clone());
        Some(g)
    }

    fn with_duration<R>(&self, name: &str, f: impl FnOnce(&DurationMetric) -> R) -> Option<R> {
        if let Some(d) = self.durations.read().get(name) {
            return Some(f(d));
        }
        let mut map = self.durations.write();
        if !map.contains_key(name) {
            let hist = Histogram::with_opts(
                HistogramOpts::new(format!("{name}_seconds"), format!("{name} latency (seconds)"))
                    .buckets(vec![0.1, 0.25, 0.5, 0.75, 1.0, 1.25, 1.5, 1.75, 2.0, 2.5, 5.0]),
            );
            let quantiles = GaugeVec::new(
                Opts::new(
                    format!("{name}_quantile_seconds"),
                    format!("{name} percentiles over recent samples (label: quantile)"),
                ),
                &["quantile"],
            );
            let (hist, quantiles) = match (hist, quantiles) {
                (Ok(h), Ok(q)) => (h, q),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(?e, %name, "metrics: invalid duration metric");
                    return None;
                }
            };
            for r in [
                self.registry.register(Box::new(hist.clone())),
                self.registry.register(Box::new(quantiles.clone())),
            ] {
                if let Err(e) = r {
                    warn!(?e, %name, "metrics: register duration failed");
                }
            }
            map.insert(
                name.to_string(),
                DurationMetric { hist, quantiles, window: Mutex::new(SampleWindow::new(self.window_cap)) },
            );
        }
        map.get(name).map(f)
    }

    /// Encode semua metric dalam format teks Prometheus
    pub fn encode(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
            buf.extend_from_slice(b"# no metrics\n");
        }
        buf
    }

    pub fn content_type(&self) -> String { TextEncoder::new().format_type().to_string() }
}

impl Default for Metrics {
    fn default() -> Self { Self::new(1024) }
}

impl MetricsSink for Metrics {
    fn increment_counter(&self, name: &str) {
        if let Some(c) = self.counter(name) {
            c.inc();
        }
    }

    fn record_duration(&self, name: &str, elapsed: Duration) {
        self.with_duration(name, |d| {
            d.hist.observe(elapsed.as_secs_f64());
            let summary = {
                let mut w = d.window.lock();
                w.push(elapsed);
                w.summary()
            };
            if let Some(s) = summary {
                for (q, v) in QUANTILES.iter().zip([s.p50, s.p95]) {
                    let label = q.to_string();
                    d.quantiles.with_label_values(&[label.as_str()]).set(v.as_secs_f64());
                }
            }
        });
    }

    fn read_counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).map(|c| c.get()).unwrap_or(0)
    }

    fn set_gauge(&self, name: &str, value: i64) {
        if let Some(g) = self.gauge(name) {
            g.set(value);
        }
    }

    fn duration_summary(&self, name: &str) -> Option<DurationSummary> {
        self.durations.read().get(name).and_then(|d| d.window.lock().summary())
    }
}
