// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

// Allow expect() in this module: used for fallback metric creation where
// the fallback name is guaranteed to be valid.
#![allow(clippy::expect_used)]

//! Safe Prometheus metric registration helpers.
//!
//! Weft is a library embedded in several binaries; when two components ask
//! for the same metric name the default registry errors and the upstream
//! `register_*` macros panic. These helpers hand back the already-created
//! metric instead, logging on help-text or shape mismatches.

use dashmap::DashMap;
use prometheus::core::Collector;
use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts};
use std::sync::LazyLock;
use tracing::{debug, warn};

static COUNTERS: LazyLock<DashMap<String, Counter>> = LazyLock::new(DashMap::new);
static GAUGES: LazyLock<DashMap<String, Gauge>> = LazyLock::new(DashMap::new);
static HISTOGRAMS: LazyLock<DashMap<String, Histogram>> = LazyLock::new(DashMap::new);
static COUNTER_VECS: LazyLock<DashMap<String, CounterVec>> = LazyLock::new(DashMap::new);
static HISTOGRAM_VECS: LazyLock<DashMap<String, HistogramVec>> = LazyLock::new(DashMap::new);

fn register_quietly<M: Collector + Clone + 'static>(name: &str, metric: &M) {
    if let Err(e) = prometheus::default_registry().register(Box::new(metric.clone())) {
        match e {
            prometheus::Error::AlreadyReg => {
                debug!(metric = name, "metric already registered; continuing");
            }
            other => {
                warn!(
                    metric = name,
                    error = %other,
                    "metric registration failed; continuing unregistered"
                );
            }
        }
    }
}

pub(crate) fn counter(name: &str, help: &str) -> Counter {
    if !name.ends_with("_total") {
        warn!(metric = name, "counter name should end with '_total'");
    }
    COUNTERS
        .entry(name.to_string())
        .or_insert_with(|| {
            let metric = Counter::new(name, help).unwrap_or_else(|e| {
                warn!(metric = name, error = %e, "failed to create counter");
                Counter::new(format!("{name}_invalid"), help)
                    .expect("fallback counter name should be valid")
            });
            register_quietly(name, &metric);
            metric
        })
        .clone()
}

pub(crate) fn gauge(name: &str, help: &str) -> Gauge {
    if name.ends_with("_total") {
        warn!(metric = name, "gauge name should not end with '_total'");
    }
    GAUGES
        .entry(name.to_string())
        .or_insert_with(|| {
            let metric = Gauge::new(name, help).unwrap_or_else(|e| {
                warn!(metric = name, error = %e, "failed to create gauge");
                Gauge::new(format!("{name}_invalid"), help)
                    .expect("fallback gauge name should be valid")
            });
            register_quietly(name, &metric);
            metric
        })
        .clone()
}

pub(crate) fn histogram(opts: HistogramOpts) -> Histogram {
    let name = opts.common_opts.name.clone();
    HISTOGRAMS
        .entry(name.clone())
        .or_insert_with(|| {
            let metric = Histogram::with_opts(opts).unwrap_or_else(|e| {
                warn!(metric = %name, error = %e, "failed to create histogram");
                Histogram::with_opts(HistogramOpts::new(
                    format!("{name}_invalid"),
                    "invalid histogram",
                ))
                .expect("fallback histogram should be valid")
            });
            register_quietly(&name, &metric);
            metric
        })
        .clone()
}

pub(crate) fn counter_vec(opts: Opts, labels: &[&str]) -> CounterVec {
    let name = opts.name.clone();
    COUNTER_VECS
        .entry(name.clone())
        .or_insert_with(|| {
            let metric = CounterVec::new(opts, labels).unwrap_or_else(|e| {
                warn!(metric = %name, error = %e, "failed to create counter vec");
                CounterVec::new(
                    Opts::new(format!("{name}_invalid"), "invalid counter vec"),
                    labels,
                )
                .expect("fallback counter vec should be valid")
            });
            register_quietly(&name, &metric);
            metric
        })
        .clone()
}

pub(crate) fn histogram_vec(opts: HistogramOpts, labels: &[&str]) -> HistogramVec {
    let name = opts.common_opts.name.clone();
    HISTOGRAM_VECS
        .entry(name.clone())
        .or_insert_with(|| {
            let metric = HistogramVec::new(opts, labels).unwrap_or_else(|e| {
                warn!(metric = %name, error = %e, "failed to create histogram vec");
                HistogramVec::new(
                    HistogramOpts::new(format!("{name}_invalid"), "invalid histogram vec"),
                    labels,
                )
                .expect("fallback histogram vec should be valid")
            });
            register_quietly(&name, &metric);
            metric
        })
        .clone()
}

/// Millisecond latency buckets shared by the RPC and TTFT histograms.
pub(crate) fn latency_buckets_ms() -> Vec<f64> {
    vec![
        1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
    ]
}
