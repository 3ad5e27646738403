//! Recording and exporting of the simulated observations.

use std::{fmt, sync::Arc};

mod histogram;
mod sink;

pub mod prometheus;

pub use self::prometheus::PrometheusExporter;

pub use self::sink::{
    LatencySummary, MetricsSink, MetricsSnapshot, QUANTILES, SeriesKey, SummaryConfig,
};

/// Outcome of a single simulated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Outcome {
    Ok,
    Error,
}

impl Outcome {
    /// HTTP status code used as `code` label.
    pub const fn code(self) -> &'static str {
        match self {
            Outcome::Ok => "200",
            Outcome::Error => "500",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "200" => Some(Outcome::Ok),
            "500" => Some(Outcome::Error),
            _ => None,
        }
    }

    pub const fn is_error(self) -> bool {
        matches!(self, Outcome::Error)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Append-only recording interface used by the simulation engine.
pub trait MetricsRecorder: Send + Sync {
    /// Add a latency sample for the (outcome, instance) pair.
    fn record_latency(&self, outcome: Outcome, instance: &str, value_ms: i64);

    /// Count one error for the (outcome, instance) pair.
    fn increment_errors(&self, outcome: Outcome, instance: &str);
}

impl<R: MetricsRecorder + ?Sized> MetricsRecorder for Arc<R> {
    #[inline(always)]
    fn record_latency(&self, outcome: Outcome, instance: &str, value_ms: i64) {
        (**self).record_latency(outcome, instance, value_ms)
    }

    #[inline(always)]
    fn increment_errors(&self, outcome: Outcome, instance: &str) {
        (**self).increment_errors(outcome, instance)
    }
}
