// Numan Thabit 2025
//! Append-only sample store shared by every virtual user.
//!
//! Each distinct `(metric, tags)` pair owns one series. Aggregates are computed
//! by a full scan at query time, so they are independent of append order.
//! Percentiles use the nearest-rank method: `rank = ceil(p / 100 * n)`, the
//! answer is the sorted value at `rank - 1`, and `p = 0` yields the minimum.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const CHECKS: &str = "checks";
pub const CHECK_ERRORS: &str = "check_errors";
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const ITERATIONS_ABORTED: &str = "iterations_aborted";

const MAX_ERRORS_PER_KEY: usize = 8;

pub type Tags = BTreeMap<String, String>;

/// Build a tag set from literal pairs.
pub fn tags<I, K, V>(pairs: I) -> Tags
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub metric: String,
    pub tags: Tags,
}

impl SeriesKey {
    fn matches(&self, metric: &str, filter: &Tags) -> bool {
        self.metric == metric
            && filter
                .iter()
                .all(|(key, value)| self.tags.get(key) == Some(value))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: String,
    pub value: f64,
    pub tags: Tags,
}

impl Sample {
    pub fn new(metric: impl Into<String>, value: f64, tags: Tags) -> Self {
        Self {
            metric: metric.into(),
            value,
            tags,
        }
    }
}

#[derive(Debug, Default)]
pub struct MetricRecorder {
    series: DashMap<SeriesKey, Vec<f64>>,
    errors: DashMap<String, BTreeSet<String>>,
    base_tags: Tags,
    appended: AtomicU64,
}

impl MetricRecorder {
    /// Create a recorder whose samples all carry `base_tags` unless the sample
    /// sets the same key itself.
    pub fn new(base_tags: Tags) -> Self {
        Self {
            base_tags,
            ..Self::default()
        }
    }

    pub fn append(&self, sample: Sample) {
        let Sample {
            metric,
            value,
            mut tags,
        } = sample;
        for (key, base) in &self.base_tags {
            tags.entry(key.clone()).or_insert_with(|| base.clone());
        }
        self.series
            .entry(SeriesKey { metric, tags })
            .or_default()
            .push(value);
        self.appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, metric: &str, value: f64, tags: Tags) {
        self.append(Sample::new(metric, value, tags));
    }

    /// Keep a bounded set of distinct error messages under `key`.
    pub fn note_error(&self, key: &str, message: impl Into<String>) {
        let mut entry = self.errors.entry(key.to_string()).or_default();
        if entry.len() < MAX_ERRORS_PER_KEY {
            entry.insert(message.into());
        }
    }

    pub fn errors(&self, key: &str) -> Vec<String> {
        self.errors
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn error_snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.errors
            .iter()
            .map(|e| (e.key().clone(), e.value().iter().cloned().collect()))
            .collect()
    }

    pub fn total_samples(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    pub fn series_keys(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self.series.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn metric_names(&self) -> Vec<String> {
        let names: BTreeSet<String> = self.series.iter().map(|e| e.key().metric.clone()).collect();
        names.into_iter().collect()
    }

    /// Distinct values of `tag` across the series of `metric`.
    pub fn tag_values(&self, metric: &str, tag: &str) -> Vec<String> {
        let values: BTreeSet<String> = self
            .series
            .iter()
            .filter(|e| e.key().metric == metric)
            .filter_map(|e| e.key().tags.get(tag).cloned())
            .collect();
        values.into_iter().collect()
    }

    /// All values of the series of `metric` whose tags contain `filter`.
    pub fn values(&self, metric: &str, filter: &Tags) -> Vec<f64> {
        let mut out = Vec::new();
        for entry in self.series.iter() {
            if entry.key().matches(metric, filter) {
                out.extend_from_slice(entry.value());
            }
        }
        out
    }

    pub fn count(&self, metric: &str, filter: &Tags) -> usize {
        self.series
            .iter()
            .filter(|e| e.key().matches(metric, filter))
            .map(|e| e.value().len())
            .sum()
    }

    /// Fraction of non-zero samples; `None` when the series is empty.
    pub fn rate(&self, metric: &str, filter: &Tags) -> Option<f64> {
        let values = self.values(metric, filter);
        rate_of(&values)
    }

    pub fn percentile(&self, metric: &str, filter: &Tags, p: f64) -> Option<f64> {
        let mut values = self.values(metric, filter);
        values.sort_by(f64::total_cmp);
        nearest_rank(&values, p)
    }

    pub fn aggregate(&self, metric: &str, filter: &Tags) -> Option<Aggregate> {
        Aggregate::from_values(self.values(metric, filter))
    }
}

fn rate_of(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let hits = values.iter().filter(|v| **v != 0.0).count();
    Some(hits as f64 / values.len() as f64)
}

/// Nearest-rank percentile over an ascending slice.
pub fn nearest_rank(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let p = p.clamp(0.0, 100.0);
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    Some(sorted[idx])
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregate {
    pub count: usize,
    pub sum: f64,
    pub rate: f64,
    pub min: f64,
    pub avg: f64,
    pub med: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

impl Aggregate {
    pub fn from_values(mut values: Vec<f64>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        let count = values.len();
        let sum: f64 = values.iter().sum();
        let pct = |p: f64| nearest_rank(&values, p).unwrap_or_default();
        Some(Self {
            count,
            sum,
            rate: rate_of(&values).unwrap_or_default(),
            min: values[0],
            avg: sum / count as f64,
            med: pct(50.0),
            p90: pct(90.0),
            p95: pct(95.0),
            p99: pct(99.0),
            max: values[count - 1],
        })
    }
}
