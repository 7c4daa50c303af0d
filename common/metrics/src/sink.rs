use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Destination for the counters, gauges and histograms emitted by a component.
///
/// Components take an `Arc<dyn MetricsSink>` at construction instead of reaching
/// for the global recorder, so tests can swap in `NoopSink` or `RecordingSink`.
pub trait MetricsSink: Send + Sync {
    fn inc(&self, name: &'static str, labels: &[(String, String)], value: u64);

    fn gauge(&self, name: &'static str, labels: &[(String, String)], value: f64);

    fn histogram(&self, name: &'static str, labels: &[(String, String)], value: f64);
}

/// Reports into the process-wide `metrics` recorder, see `setup_metrics_recorder`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn inc(&self, name: &'static str, labels: &[(String, String)], value: u64) {
        metrics::counter!(name, labels).increment(value);
    }

    fn gauge(&self, name: &'static str, labels: &[(String, String)], value: f64) {
        metrics::gauge!(name, labels).set(value);
    }

    fn histogram(&self, name: &'static str, labels: &[(String, String)], value: f64) {
        metrics::histogram!(name, labels).record(value);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn inc(&self, _: &'static str, _: &[(String, String)], _: u64) {}

    fn gauge(&self, _: &'static str, _: &[(String, String)], _: f64) {}

    fn histogram(&self, _: &'static str, _: &[(String, String)], _: f64) {}
}

/// Keeps everything in memory, keyed by metric name. Label sets are summed
/// together for counters; gauges keep the last value written.
#[derive(Debug, Default)]
pub struct RecordingSink {
    counters: Mutex<HashMap<&'static str, u64>>,
    gauges: Mutex<HashMap<&'static str, f64>>,
    histograms: Mutex<HashMap<&'static str, Vec<f64>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(name).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn last_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.lock().ok().and_then(|g| g.get(name).copied())
    }

    pub fn histogram_samples(&self, name: &str) -> Vec<f64> {
        self.histograms
            .lock()
            .map(|h| h.get(name).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl MetricsSink for RecordingSink {
    fn inc(&self, name: &'static str, _: &[(String, String)], value: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name).or_default() += value;
        }
    }

    fn gauge(&self, name: &'static str, _: &[(String, String)], value: f64) {
        if let Ok(mut gauges) = self.gauges.lock() {
            gauges.insert(name, value);
        }
    }

    fn histogram(&self, name: &'static str, _: &[(String, String)], value: f64) {
        if let Ok(mut histograms) = self.histograms.lock() {
            histograms.entry(name).or_default().push(value);
        }
    }
}

// A guard to record the time between creation and drop as a histogram entry, in milliseconds
pub struct TimingGuard<'a> {
    sink: &'a dyn MetricsSink,
    name: &'static str,
    labels: Vec<(String, String)>,
    start: Instant,
}

impl<'a> TimingGuard<'a> {
    pub fn new(sink: &'a dyn MetricsSink, name: &'static str) -> Self {
        TimingGuard {
            sink,
            name,
            labels: Vec::new(),
            start: Instant::now(),
        }
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    // Makes "report the timing now" explicit at call sites
    pub fn fin(self) {}
}

impl Drop for TimingGuard<'_> {
    fn drop(&mut self) {
        self.sink.histogram(
            self.name,
            &self.labels,
            self.start.elapsed().as_millis() as f64,
        );
    }
}
