//! Prometheus exposition of the [`MetricsSink`].
//!
//! Errors are a plain [`IntCounterVec`] owned by the sink. Latencies are
//! exposed as a summary by [`LatencyCollector`], which turns the sink's
//! sliding-window quantiles into protobuf metric families at scrape time.

use std::{collections::HashMap, fmt, sync::Arc};

use prometheus::{
    Encoder as _, IntCounterVec, Opts, Registry, TextEncoder,
    core::{Collector, Desc},
    proto::{LabelPair, Metric, MetricFamily, MetricType, Quantile, Summary},
};
use rama::error::{BoxError, ErrorContext as _};

use super::{MetricsSink, MetricsSnapshot};

pub const REQUEST_DURATION_METRIC: &str = "request_duration_millis";
const REQUEST_DURATION_HELP: &str = "The duration of requests";

pub const ERRORS_METRIC: &str = "errors_encountered_total";
const ERRORS_HELP: &str = "The total number of errors encountered";

pub(super) const LABEL_CODE: &str = "code";
pub(super) const LABEL_INSTANCE: &str = "instance";

/// Content type of [`PrometheusExporter::encode`]'s output.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub(super) fn new_error_counter() -> Result<IntCounterVec, prometheus::Error> {
    IntCounterVec::new(
        Opts::new(ERRORS_METRIC, ERRORS_HELP),
        &[LABEL_CODE, LABEL_INSTANCE],
    )
}

/// Registry holding every metric of a [`MetricsSink`].
#[derive(Clone)]
pub struct PrometheusExporter {
    registry: Registry,
}

impl fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusExporter").finish_non_exhaustive()
    }
}

impl PrometheusExporter {
    pub fn try_new(sink: Arc<MetricsSink>) -> Result<Self, BoxError> {
        let registry = Registry::new();
        registry
            .register(Box::new(sink.error_counter().clone()))
            .context("register error counter")?;
        registry
            .register(Box::new(LatencyCollector::try_new(sink)?))
            .context("register latency collector")?;
        Ok(Self { registry })
    }

    /// Text exposition of all registered metrics.
    pub fn encode(&self) -> Result<String, BoxError> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .context("encode metric families")?;
        String::from_utf8(buffer).context("metric exposition is not utf-8")
    }
}

/// Exposes the latency series of a sink as the `request_duration_millis` summary.
pub struct LatencyCollector {
    sink: Arc<MetricsSink>,
    desc: Desc,
}

impl LatencyCollector {
    pub fn try_new(sink: Arc<MetricsSink>) -> Result<Self, BoxError> {
        let desc = Desc::new(
            REQUEST_DURATION_METRIC.to_owned(),
            REQUEST_DURATION_HELP.to_owned(),
            vec![LABEL_CODE.to_owned(), LABEL_INSTANCE.to_owned()],
            HashMap::new(),
        )
        .context("create latency summary descriptor")?;
        Ok(Self { sink, desc })
    }
}

impl Collector for LatencyCollector {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        vec![latency_family(&self.sink.snapshot())]
    }
}

fn latency_family(snapshot: &MetricsSnapshot) -> MetricFamily {
    let mut family = MetricFamily::default();
    family.set_name(REQUEST_DURATION_METRIC.to_owned());
    family.set_help(REQUEST_DURATION_HELP.to_owned());
    family.set_field_type(MetricType::SUMMARY);

    for (key, latency) in &snapshot.latencies {
        let mut summary = Summary::default();
        summary.set_sample_count(latency.count);
        summary.set_sample_sum(latency.sum as f64);
        for &(q, value) in &latency.quantiles {
            let mut quantile = Quantile::default();
            quantile.set_quantile(q);
            // an empty window has no quantiles
            quantile.set_value(value.map_or(f64::NAN, |v| v as f64));
            summary.mut_quantile().push(quantile);
        }

        let mut metric = Metric::default();
        metric
            .mut_label()
            .push(label_pair(LABEL_CODE, key.outcome.code()));
        metric
            .mut_label()
            .push(label_pair(LABEL_INSTANCE, &key.instance));
        metric.set_summary(summary);
        family.mut_metric().push(metric);
    }

    family
}

fn label_pair(name: &str, value: &str) -> LabelPair {
    let mut pair = LabelPair::default();
    pair.set_name(name.to_owned());
    pair.set_value(value.to_owned());
    pair
}
