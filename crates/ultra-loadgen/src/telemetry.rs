// Numan Thabit 2025
//! Live Prometheus counters for a running load test.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, opts, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, Registry, TextEncoder,
};

static METRICS_ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);

pub struct EngineMetrics {
    registry: Registry,
    active_vus: IntGauge,
    iterations: IntCounter,
    iterations_aborted: IntCounterVec,
    requests: IntCounterVec,
    request_failures: IntCounter,
    request_latency: HistogramVec,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("ultra_loadgen".into()), None)
            .context("failed to create metrics registry")?;

        let active_vus = IntGauge::with_opts(opts!("active_vus", "Currently active virtual users"))
            .context("failed to build active_vus gauge")?;
        let iterations = IntCounter::with_opts(opts!(
            "iterations_total",
            "Completed workflow iterations"
        ))
        .context("failed to build iterations counter")?;
        let iterations_aborted = IntCounterVec::new(
            opts!(
                "iterations_aborted_total",
                "Workflow iterations aborted before their last step"
            ),
            &["reason"],
        )
        .context("failed to build aborted iterations counter")?;
        let requests = IntCounterVec::new(
            opts!("http_requests_total", "HTTP requests issued per step"),
            &["name"],
        )
        .context("failed to build requests counter")?;
        let request_failures = IntCounter::with_opts(opts!(
            "http_request_failures_total",
            "HTTP requests that failed in transport or returned status >= 400"
        ))
        .context("failed to build request failures counter")?;
        let latency_buckets =
            exponential_buckets(1e-3, 2.0, 14).context("failed to build latency buckets")?;
        let request_latency = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request latency")
                .buckets(latency_buckets),
            &["name"],
        )
        .context("failed to build request latency histogram")?;

        registry
            .register(Box::new(active_vus.clone()))
            .context("register active_vus")?;
        registry
            .register(Box::new(iterations.clone()))
            .context("register iterations")?;
        registry
            .register(Box::new(iterations_aborted.clone()))
            .context("register iterations_aborted")?;
        registry
            .register(Box::new(requests.clone()))
            .context("register requests")?;
        registry
            .register(Box::new(request_failures.clone()))
            .context("register request failures")?;
        registry
            .register(Box::new(request_latency.clone()))
            .context("register request latency")?;

        Ok(Self {
            registry,
            active_vus,
            iterations,
            iterations_aborted,
            requests,
            request_failures,
            request_latency,
        })
    }

    pub fn set_active_vus(&self, active: usize) {
        self.active_vus.set(active as i64);
    }

    pub fn record_iteration(&self) {
        self.iterations.inc();
    }

    pub fn record_aborted(&self, reason: &str) {
        self.iterations_aborted.with_label_values(&[reason]).inc();
    }

    /// `latency` is `None` when the request never got a response.
    pub fn record_request(&self, name: &str, latency: Option<Duration>, failed: bool) {
        self.requests.with_label_values(&[name]).inc();
        if let Some(latency) = latency {
            self.request_latency
                .with_label_values(&[name])
                .observe(latency.as_secs_f64());
        }
        if failed {
            self.request_failures.inc();
        }
    }

    pub fn content_type(&self) -> String {
        METRICS_ENCODER.format_type().to_string()
    }

    pub fn render(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let mut buf = Vec::with_capacity(4096);
        METRICS_ENCODER
            .encode(&metric_families, &mut buf)
            .context("failed to encode metrics")?;
        String::from_utf8(buf).map_err(|err| anyhow!("metrics output not utf8: {err}"))
    }
}
