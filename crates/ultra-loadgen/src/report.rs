// Numan Thabit 2025
//! End-of-run summary built from the recorder once every virtual user is joined.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::metrics::{
    tags, Aggregate, MetricRecorder, Tags, CHECKS, HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED,
    ITERATION_DURATION,
};
use crate::scheduler::ScheduleSummary;
use crate::threshold::ThresholdOutcome;

/// Metrics whose values are durations in milliseconds.
const TIMED_METRICS: [&str; 2] = [HTTP_REQ_DURATION, ITERATION_DURATION];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckTally {
    pub passes: usize,
    pub fails: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub name: String,
    pub started_at: String,
    pub duration_ms: u64,
    pub total_iterations: u64,
    pub aborted_iterations: u64,
    pub peak_vus: u32,
    pub interrupted: bool,
    pub metrics: BTreeMap<String, Aggregate>,
    pub checks: BTreeMap<String, CheckTally>,
    pub thresholds: Vec<ThresholdOutcome>,
    pub errors: BTreeMap<String, Vec<String>>,
    pub passed: bool,
}

impl RunReport {
    pub fn build(
        name: &str,
        started_at: OffsetDateTime,
        summary: &ScheduleSummary,
        recorder: &MetricRecorder,
        thresholds: Vec<ThresholdOutcome>,
    ) -> Self {
        let metrics = recorder
            .metric_names()
            .into_iter()
            .filter_map(|metric| {
                recorder
                    .aggregate(&metric, &Tags::new())
                    .map(|agg| (metric, agg))
            })
            .collect();

        let checks = recorder
            .tag_values(CHECKS, "check")
            .into_iter()
            .map(|check| {
                let values = recorder.values(CHECKS, &tags([("check", check.as_str())]));
                let passes = values.iter().filter(|v| **v != 0.0).count();
                let tally = CheckTally {
                    passes,
                    fails: values.len() - passes,
                    errors: recorder.errors(&format!("check:{check}")),
                };
                (check, tally)
            })
            .collect();

        let passed = thresholds.iter().all(|t| t.passed);
        Self {
            name: name.to_string(),
            started_at: started_at
                .format(&Rfc3339)
                .unwrap_or_else(|_| started_at.unix_timestamp().to_string()),
            duration_ms: summary.elapsed.as_millis() as u64,
            total_iterations: summary.completed_iterations,
            aborted_iterations: summary.aborted_iterations,
            peak_vus: summary.peak_vus,
            interrupted: summary.interrupted,
            metrics,
            checks,
            thresholds,
            errors: recorder.error_snapshot(),
            passed,
        }
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdOutcome> {
        self.thresholds.iter().filter(|t| !t.passed)
    }

    pub fn log(&self) {
        let reqs = self.metrics.get(HTTP_REQS).map_or(0, |a| a.count);
        let failed_rate = self.metrics.get(HTTP_REQ_FAILED).map(|a| a.rate);
        let p95 = self.metrics.get(HTTP_REQ_DURATION).map(|a| a.p95);
        info!(
            name = %self.name,
            duration = %humantime::format_duration(Duration::from_millis(self.duration_ms)),
            iterations = self.total_iterations,
            aborted = self.aborted_iterations,
            peak_vus = self.peak_vus,
            requests = reqs,
            failed_rate = ?failed_rate,
            p95_ms = ?p95,
            interrupted = self.interrupted,
            passed = self.passed,
            "load test finished"
        );
        for breach in self.failed_thresholds() {
            warn!(
                metric = %breach.metric,
                condition = %breach.condition,
                observed = ?breach.observed,
                "threshold failed"
            );
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).with_context(|| {
                    format!("failed to create report directory {}", dir.display())
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to open report path {}", path.display()))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        Ok(())
    }
}

fn fmt_value(metric: &str, value: f64) -> String {
    if TIMED_METRICS.contains(&metric) {
        if value >= 1_000.0 {
            format!("{:.2}s", value / 1_000.0)
        } else {
            format!("{value:.2}ms")
        }
    } else {
        format!("{value:.2}")
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed { "PASSED" } else { "FAILED" };
        writeln!(f, "{} {} (started {})", self.name, verdict, self.started_at)?;
        writeln!(
            f,
            "  duration {}  iterations {} (aborted {})  peak vus {}{}",
            humantime::format_duration(Duration::from_millis(self.duration_ms)),
            self.total_iterations,
            self.aborted_iterations,
            self.peak_vus,
            if self.interrupted { "  [interrupted]" } else { "" },
        )?;

        if !self.checks.is_empty() {
            writeln!(f, "\n  checks")?;
            for (name, tally) in &self.checks {
                let total = tally.passes + tally.fails;
                let mark = if tally.fails == 0 { "ok  " } else { "FAIL" };
                let pct = if total == 0 {
                    0.0
                } else {
                    tally.passes as f64 * 100.0 / total as f64
                };
                writeln!(
                    f,
                    "    {mark} {name:<32} {pct:>6.2}% ({}/{total})",
                    tally.passes
                )?;
            }
        }

        writeln!(f, "\n  metrics")?;
        for (metric, agg) in &self.metrics {
            if TIMED_METRICS.contains(&metric.as_str()) {
                writeln!(
                    f,
                    "    {metric:<24} avg={} min={} med={} max={} p(90)={} p(95)={}",
                    fmt_value(metric, agg.avg),
                    fmt_value(metric, agg.min),
                    fmt_value(metric, agg.med),
                    fmt_value(metric, agg.max),
                    fmt_value(metric, agg.p90),
                    fmt_value(metric, agg.p95),
                )?;
            } else if metric == HTTP_REQ_FAILED || metric == CHECKS {
                writeln!(
                    f,
                    "    {metric:<24} {:.2}% ({} samples)",
                    agg.rate * 100.0,
                    agg.count
                )?;
            } else {
                writeln!(f, "    {metric:<24} {}", agg.count)?;
            }
        }

        if !self.thresholds.is_empty() {
            writeln!(f, "\n  thresholds")?;
            for outcome in &self.thresholds {
                let mark = if outcome.passed { "ok  " } else { "FAIL" };
                let observed = outcome
                    .observed
                    .map_or_else(|| "no data".to_string(), |v| fmt_value(&outcome.metric, v));
                writeln!(
                    f,
                    "    {mark} {} {} (observed {observed})",
                    outcome.metric, outcome.condition
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ITERATIONS;
    use crate::threshold::ThresholdEvaluator;
    use crate::threshold::ThresholdSpec;

    fn summary() -> ScheduleSummary {
        ScheduleSummary {
            elapsed: Duration::from_secs(120),
            completed_iterations: 3,
            aborted_iterations: 1,
            per_vu_iterations: BTreeMap::from([(0, 2), (1, 2)]),
            peak_vus: 2,
            interrupted: false,
            forced_stop: false,
            capped: false,
        }
    }

    fn recorder() -> MetricRecorder {
        let recorder = MetricRecorder::default();
        for ms in [100.0, 200.0, 1_500.0] {
            recorder.add(HTTP_REQ_DURATION, ms, Tags::new());
            recorder.add(HTTP_REQ_FAILED, 0.0, Tags::new());
            recorder.add(ITERATIONS, 1.0, Tags::new());
        }
        recorder.add(CHECKS, 1.0, tags([("check", "products loaded")]));
        recorder.add(CHECKS, 0.0, tags([("check", "products loaded")]));
        recorder.note_error("check:products loaded", "body is not json");
        recorder
    }

    #[test]
    fn report_aggregates_checks_and_verdict() {
        let recorder = recorder();
        let thresholds = ThresholdEvaluator::new(vec![
            ThresholdSpec::parse(HTTP_REQ_DURATION, "p(95) < 1000ms", false).expect("p95"),
            ThresholdSpec::parse(HTTP_REQ_FAILED, "rate < 0.1", false).expect("rate"),
        ])
        .evaluate(&recorder);

        let report = RunReport::build(
            "shop",
            OffsetDateTime::UNIX_EPOCH,
            &summary(),
            &recorder,
            thresholds,
        );

        assert_eq!(report.started_at, "1970-01-01T00:00:00Z");
        assert_eq!(report.duration_ms, 120_000);
        assert_eq!(report.total_iterations, 3);
        assert!(!report.passed);
        assert_eq!(report.failed_thresholds().count(), 1);
        assert_eq!(report.metrics[HTTP_REQ_DURATION].p95, 1_500.0);
        assert_eq!(
            report.checks["products loaded"],
            CheckTally {
                passes: 1,
                fails: 1,
                errors: vec!["body is not json".to_string()],
            }
        );

        let text = report.to_string();
        assert!(text.contains("shop FAILED"));
        assert!(text.contains("FAIL http_req_duration p(95) < 1000ms (observed 1.50s)"));
        assert!(text.contains("ok   http_req_failed rate < 0.1"));
    }

    #[test]
    fn report_is_written_as_pretty_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("report.json");
        let report = RunReport::build(
            "shop",
            OffsetDateTime::UNIX_EPOCH,
            &summary(),
            &recorder(),
            Vec::new(),
        );

        report.write_json(&path).expect("write report");
        let raw = fs::read_to_string(&path).expect("read report");
        let parsed: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(parsed["passed"], serde_json::Value::Bool(true));
        assert_eq!(parsed["checks"]["products loaded"]["fails"], 1);
        assert_eq!(parsed["metrics"]["iterations"]["count"], 3);
    }
}
