use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    time::Duration,
};

use parking_lot::Mutex;
use prometheus::{IntCounterVec, core::Collector as _};
use rama::{
    error::{BoxError, ErrorContext as _},
    telemetry::tracing,
};
use tokio::time::Instant;

use super::{
    MetricsRecorder, Outcome,
    histogram::SignedHistogram,
    prometheus::{LABEL_CODE, LABEL_INSTANCE, new_error_counter},
};

/// Quantiles reported for every latency series.
pub const QUANTILES: [f64; 3] = [0.5, 0.9, 0.99];

/// Sliding window used for the latency quantiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryConfig {
    /// Samples older than this no longer count towards the quantiles,
    /// zero keeps all samples.
    pub max_age: Duration,
    /// Amount of buckets the window rotates through.
    pub age_buckets: u32,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(600),
            age_buckets: 5,
        }
    }
}

impl SummaryConfig {
    fn bucket_width(&self) -> Option<Duration> {
        if self.max_age.is_zero() {
            return None;
        }
        Some(self.max_age / self.age_buckets.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub outcome: Outcome,
    pub instance: String,
}

impl SeriesKey {
    pub fn new(outcome: Outcome, instance: impl Into<String>) -> Self {
        Self {
            outcome,
            instance: instance.into(),
        }
    }
}

/// Thread-safe store of all recorded observations.
///
/// Both aggregates only ever grow: series are never removed,
/// not even when the instance they belong to is deleted.
pub struct MetricsSink {
    config: SummaryConfig,
    template: SignedHistogram,
    latencies: Mutex<BTreeMap<SeriesKey, LatencySeries>>,
    errors: IntCounterVec,
}

impl fmt::Debug for MetricsSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsSink")
            .field("config", &self.config)
            .field("latency_series", &self.latencies.lock().len())
            .finish_non_exhaustive()
    }
}

impl MetricsSink {
    pub fn try_new(config: SummaryConfig) -> Result<Self, BoxError> {
        let template = SignedHistogram::try_new().context("create latency histogram template")?;
        let errors = new_error_counter().context("create error counter")?;
        Ok(Self {
            config,
            template,
            latencies: Default::default(),
            errors,
        })
    }

    /// Read-side copy of all aggregates, used by the exporter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub(super) fn error_counter(&self) -> &IntCounterVec {
        &self.errors
    }

    fn snapshot_at(&self, now: Instant) -> MetricsSnapshot {
        let latencies = {
            let mut latencies = self.latencies.lock();
            latencies
                .iter_mut()
                .map(|(key, series)| {
                    let summary = series.summarize(&self.config, &self.template, now);
                    (key.clone(), summary)
                })
                .collect()
        };
        MetricsSnapshot {
            latencies,
            errors: self.error_counts(),
        }
    }

    fn error_counts(&self) -> BTreeMap<SeriesKey, u64> {
        self.errors
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .filter_map(|metric| {
                let mut outcome = None;
                let mut instance = None;
                for label in metric.get_label() {
                    match label.get_name() {
                        LABEL_CODE => outcome = Outcome::from_code(label.get_value()),
                        LABEL_INSTANCE => instance = Some(label.get_value()),
                        _ => (),
                    }
                }
                let count = metric.get_counter().get_value() as u64;
                Some((SeriesKey::new(outcome?, instance?), count))
            })
            .collect()
    }

    fn record_latency_at(&self, outcome: Outcome, instance: &str, value_ms: i64, now: Instant) {
        let mut latencies = self.latencies.lock();
        let series = latencies
            .entry(SeriesKey::new(outcome, instance))
            .or_insert_with(|| LatencySeries::new(value_ms));
        series.record(&self.config, &self.template, now, value_ms);
    }
}

impl MetricsRecorder for MetricsSink {
    fn record_latency(&self, outcome: Outcome, instance: &str, value_ms: i64) {
        self.record_latency_at(outcome, instance, value_ms, Instant::now())
    }

    fn increment_errors(&self, outcome: Outcome, instance: &str) {
        self.errors
            .with_label_values(&[outcome.code(), instance])
            .inc();
    }
}

#[derive(Debug)]
struct LatencySeries {
    count: u64,
    sum: i64,
    min: i64,
    max: i64,
    window: VecDeque<WindowBucket>,
}

#[derive(Debug)]
struct WindowBucket {
    opened: Instant,
    histogram: SignedHistogram,
}

impl LatencySeries {
    fn new(first: i64) -> Self {
        Self {
            count: 0,
            sum: 0,
            min: first,
            max: first,
            window: VecDeque::new(),
        }
    }

    fn record(&mut self, cfg: &SummaryConfig, template: &SignedHistogram, now: Instant, value: i64) {
        self.count = self.count.saturating_add(1);
        self.sum = self.sum.saturating_add(value);
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        self.expire(cfg, now);

        let open_new = match (self.window.back(), cfg.bucket_width()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(bucket), Some(width)) => now.saturating_duration_since(bucket.opened) >= width,
        };
        if open_new {
            self.window.push_back(WindowBucket {
                opened: now,
                histogram: SignedHistogram::new_from(template),
            });
        }

        if let Some(bucket) = self.window.back_mut()
            && let Err(err) = bucket.histogram.record(value)
        {
            tracing::debug!("failed to record latency value {value} in histogram: {err}");
        }
    }

    fn expire(&mut self, cfg: &SummaryConfig, now: Instant) {
        if cfg.max_age.is_zero() {
            return;
        }
        while let Some(bucket) = self.window.front() {
            if now.saturating_duration_since(bucket.opened) < cfg.max_age {
                break;
            }
            self.window.pop_front();
        }
    }

    fn summarize(
        &mut self,
        cfg: &SummaryConfig,
        template: &SignedHistogram,
        now: Instant,
    ) -> LatencySummary {
        self.expire(cfg, now);

        let mut merged = SignedHistogram::new_from(template);
        for bucket in &self.window {
            if let Err(err) = merged.add(&bucket.histogram) {
                tracing::debug!("failed to merge latency window bucket: {err}");
            }
        }

        let quantiles = QUANTILES
            .iter()
            .map(|&q| (q, merged.value_at_quantile(q)))
            .collect();

        LatencySummary {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            window_count: merged.len(),
            quantiles,
        }
    }
}

/// Summary of one latency series.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencySummary {
    /// Samples recorded over the lifetime of the process.
    pub count: u64,
    /// Sum of all samples recorded over the lifetime of the process.
    pub sum: i64,
    pub min: i64,
    pub max: i64,
    /// Samples still inside the quantile window.
    pub window_count: u64,
    /// `None` if the window holds no samples.
    pub quantiles: Vec<(f64, Option<i64>)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub latencies: BTreeMap<SeriesKey, LatencySummary>,
    pub errors: BTreeMap<SeriesKey, u64>,
}

impl MetricsSnapshot {
    pub fn latency(&self, outcome: Outcome, instance: &str) -> Option<&LatencySummary> {
        self.latencies.get(&SeriesKey::new(outcome, instance))
    }

    pub fn error_count(&self, outcome: Outcome, instance: &str) -> u64 {
        self.errors
            .get(&SeriesKey::new(outcome, instance))
            .copied()
            .unwrap_or_default()
    }

    /// Latency samples of an instance, across outcomes.
    pub fn sample_count(&self, instance: &str) -> u64 {
        self.latencies
            .iter()
            .filter(|(key, _)| key.instance == instance)
            .map(|(_, summary)| summary.count)
            .sum()
    }

    pub fn total_samples(&self) -> u64 {
        self.latencies.values().map(|summary| summary.count).sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.errors.values().sum()
    }
}
