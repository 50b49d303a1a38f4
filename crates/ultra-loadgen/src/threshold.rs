// Numan Thabit 2025
//! Pass/fail conditions over aggregated metrics.
//!
//! Expressions look like `p(95) < 1000ms`, `rate < 0.1` or `count >= 10`.
//! Duration units are normalised to milliseconds, the unit the recorder stores
//! durations in. A threshold whose metric has no samples passes, except `count`
//! which observes zero.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ThresholdParseError;
use crate::metrics::{MetricRecorder, Tags};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stat {
    Percentile(f64),
    Avg,
    Min,
    Max,
    Med,
    Count,
    Rate,
    Sum,
}

impl Stat {
    fn parse(token: &str) -> Result<Self, ThresholdParseError> {
        let token = token.trim();
        let lower = token.to_ascii_lowercase();
        let stat = match lower.as_str() {
            "avg" => Stat::Avg,
            "min" => Stat::Min,
            "max" => Stat::Max,
            "med" => Stat::Med,
            "count" => Stat::Count,
            "rate" => Stat::Rate,
            "sum" => Stat::Sum,
            _ => {
                let raw = lower
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .or_else(|| lower.strip_prefix('p'))
                    .ok_or_else(|| ThresholdParseError::UnknownStat(token.to_string()))?;
                let pct = raw
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| ThresholdParseError::InvalidPercentile(token.to_string()))?;
                if !(0.0..=100.0).contains(&pct) {
                    return Err(ThresholdParseError::InvalidPercentile(token.to_string()));
                }
                Stat::Percentile(pct)
            }
        };
        Ok(stat)
    }

    fn observe(&self, recorder: &MetricRecorder, metric: &str, filter: &Tags) -> Option<f64> {
        match self {
            Stat::Count => Some(recorder.count(metric, filter) as f64),
            Stat::Rate => recorder.rate(metric, filter),
            Stat::Percentile(p) => recorder.percentile(metric, filter, *p),
            Stat::Med => recorder.percentile(metric, filter, 50.0),
            Stat::Avg => recorder.aggregate(metric, filter).map(|a| a.avg),
            Stat::Min => recorder.aggregate(metric, filter).map(|a| a.min),
            Stat::Max => recorder.aggregate(metric, filter).map(|a| a.max),
            Stat::Sum => recorder.aggregate(metric, filter).map(|a| a.sum),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    fn holds(self, observed: f64, expected: f64) -> bool {
        match self {
            Op::Lt => observed < expected,
            Op::Le => observed <= expected,
            Op::Gt => observed > expected,
            Op::Ge => observed >= expected,
            Op::Eq => (observed - expected).abs() < f64::EPSILON,
            Op::Ne => (observed - expected).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub stat: Stat,
    pub op: Op,
    pub value: f64,
    source: String,
}

impl Condition {
    pub fn parse(expr: &str) -> Result<Self, ThresholdParseError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ThresholdParseError::Empty);
        }
        let idx = expr
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| ThresholdParseError::MissingOperator(expr.to_string()))?;
        let (lhs, rest) = expr.split_at(idx);
        let (op, rhs) = if let Some(rhs) = rest.strip_prefix("<=") {
            (Op::Le, rhs)
        } else if let Some(rhs) = rest.strip_prefix(">=") {
            (Op::Ge, rhs)
        } else if let Some(rhs) = rest.strip_prefix("==") {
            (Op::Eq, rhs)
        } else if let Some(rhs) = rest.strip_prefix("!=") {
            (Op::Ne, rhs)
        } else if let Some(rhs) = rest.strip_prefix('<') {
            (Op::Lt, rhs)
        } else if let Some(rhs) = rest.strip_prefix('>') {
            (Op::Gt, rhs)
        } else {
            return Err(ThresholdParseError::MissingOperator(expr.to_string()));
        };

        Ok(Self {
            stat: Stat::parse(lhs)?,
            op,
            value: parse_value(rhs)?,
            source: expr.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_value(token: &str) -> Result<f64, ThresholdParseError> {
    let token = token.trim();
    let invalid = || ThresholdParseError::InvalidValue(token.to_string());
    let (value, unit) = split_numeric_unit(token).ok_or_else(invalid)?;
    let scale = match unit {
        "" | "ms" => 1.0,
        "s" => 1_000.0,
        "m" => 60_000.0,
        "us" | "µs" | "μs" => 0.001,
        "ns" => 0.000_001,
        _ => return Err(invalid()),
    };
    Ok(value * scale)
}

fn split_numeric_unit(token: &str) -> Option<(f64, &str)> {
    if token.is_empty() {
        return None;
    }
    let idx = token
        .char_indices()
        .find(|(i, ch)| !(ch.is_ascii_digit() || *ch == '.' || (*i == 0 && *ch == '-')))
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    let value = token[..idx].parse::<f64>().ok()?;
    Some((value, token[idx..].trim()))
}

/// Split `http_req_duration{name:login,method:GET}` into metric and filter.
pub fn parse_metric_key(key: &str) -> Result<(String, Tags), ThresholdParseError> {
    let key = key.trim();
    let Some(open) = key.find('{') else {
        return Ok((key.to_string(), Tags::new()));
    };
    let inner = key[open + 1..]
        .strip_suffix('}')
        .ok_or_else(|| ThresholdParseError::InvalidTagFilter(key.to_string()))?;
    let mut filter = Tags::new();
    for pair in inner.split(',').filter(|p| !p.trim().is_empty()) {
        let (k, v) = pair
            .split_once(':')
            .ok_or_else(|| ThresholdParseError::InvalidTagFilter(key.to_string()))?;
        filter.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok((key[..open].trim().to_string(), filter))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSpec {
    pub key: String,
    pub metric: String,
    pub filter: Tags,
    pub condition: Condition,
    pub abort_on_fail: bool,
}

impl ThresholdSpec {
    pub fn parse(key: &str, expr: &str, abort_on_fail: bool) -> Result<Self, ThresholdParseError> {
        let (metric, filter) = parse_metric_key(key)?;
        Ok(Self {
            key: key.trim().to_string(),
            metric,
            filter,
            condition: Condition::parse(expr)?,
            abort_on_fail,
        })
    }

    pub fn evaluate(&self, recorder: &MetricRecorder) -> ThresholdOutcome {
        let observed = self
            .condition
            .stat
            .observe(recorder, &self.metric, &self.filter);
        let passed = observed.map_or(true, |value| {
            self.condition.op.holds(value, self.condition.value)
        });
        ThresholdOutcome {
            metric: self.key.clone(),
            condition: self.condition.to_string(),
            observed,
            passed,
            abort_on_fail: self.abort_on_fail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdOutcome {
    pub metric: String,
    pub condition: String,
    pub observed: Option<f64>,
    pub passed: bool,
    #[serde(skip)]
    pub abort_on_fail: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ThresholdEvaluator {
    specs: Vec<ThresholdSpec>,
}

impl ThresholdEvaluator {
    pub fn new(specs: Vec<ThresholdSpec>) -> Self {
        Self { specs }
    }

    pub fn specs(&self) -> &[ThresholdSpec] {
        &self.specs
    }

    /// Pure function of recorder state, so cadence never changes the verdict.
    pub fn evaluate(&self, recorder: &MetricRecorder) -> Vec<ThresholdOutcome> {
        self.specs
            .iter()
            .map(|spec| spec.evaluate(recorder))
            .collect()
    }

    /// Evaluate every `every` until `stop` fires. Cancels `abort` when a
    /// threshold flagged `abort_on_fail` is breached.
    pub async fn watch(
        self: Arc<Self>,
        recorder: Arc<MetricRecorder>,
        every: Duration,
        stop: CancellationToken,
        abort: CancellationToken,
    ) {
        if self.specs.is_empty() || every.is_zero() {
            return;
        }
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let outcomes = self.evaluate(&recorder);
            let failing: Vec<&ThresholdOutcome> = outcomes.iter().filter(|o| !o.passed).collect();
            debug!(failing = failing.len(), total = outcomes.len(), "periodic threshold evaluation");
            if let Some(breach) = failing.iter().find(|o| o.abort_on_fail) {
                warn!(
                    metric = %breach.metric,
                    condition = %breach.condition,
                    observed = ?breach.observed,
                    "threshold breached with abort_on_fail; stopping run"
                );
                abort.cancel();
                return;
            }
        }
    }
}
