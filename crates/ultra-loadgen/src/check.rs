// Numan Thabit 2025
//! Named boolean assertions against a response.
//!
//! A check never aborts the workflow. Predicate errors and panics are recorded
//! as failed checks with the error kept as metadata.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::http::Response;
use crate::metrics::{MetricRecorder, Tags, CHECKS, CHECK_ERRORS};

type Predicate = dyn Fn(&Response) -> Result<bool, String> + Send + Sync;

#[derive(Clone)]
pub struct Check {
    name: String,
    predicate: Arc<Predicate>,
}

impl std::fmt::Debug for Check {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Check").field("name", &self.name).finish()
    }
}

impl Check {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Response) -> Result<bool, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, response: &Response) -> Result<bool, String> {
        match catch_unwind(AssertUnwindSafe(|| (self.predicate)(response))) {
            Ok(result) => result,
            Err(panic) => Err(panic_message(panic)),
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("predicate panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("predicate panicked: {msg}")
    } else {
        "predicate panicked".to_string()
    }
}

/// Declarative predicates available from configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckKind {
    Status(Vec<u16>),
    BodyContains(String),
    JsonExists(String),
    JsonEquals { pointer: String, value: Value },
    MaxDuration(Duration),
    HeaderPresent(String),
}

impl CheckKind {
    pub fn into_check(self, name: impl Into<String>) -> Check {
        match self {
            CheckKind::Status(codes) => Check::new(name, move |r| Ok(codes.contains(&r.status))),
            CheckKind::BodyContains(needle) => {
                Check::new(name, move |r| Ok(r.text().contains(needle.as_str())))
            }
            CheckKind::JsonExists(pointer) => Check::new(name, move |r| {
                let doc = r.json().map_err(|err| format!("body is not json: {err}"))?;
                Ok(doc.pointer(&pointer).is_some_and(|v| !v.is_null()))
            }),
            CheckKind::JsonEquals { pointer, value } => Check::new(name, move |r| {
                let doc = r.json().map_err(|err| format!("body is not json: {err}"))?;
                Ok(doc.pointer(&pointer) == Some(&value))
            }),
            CheckKind::MaxDuration(limit) => Check::new(name, move |r| Ok(r.timing <= limit)),
            CheckKind::HeaderPresent(header) => {
                Check::new(name, move |r| Ok(r.header(&header).is_some()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub error: Option<String>,
}

pub struct CheckEvaluator {
    recorder: Arc<MetricRecorder>,
}

impl CheckEvaluator {
    pub fn new(recorder: Arc<MetricRecorder>) -> Self {
        Self { recorder }
    }

    /// Run every check against `response`; later checks run regardless of
    /// earlier outcomes.
    pub fn evaluate(&self, response: &Response, checks: &[Check], tags: &Tags) -> Vec<CheckResult> {
        checks
            .iter()
            .map(|check| {
                let (passed, error) = match check.run(response) {
                    Ok(passed) => (passed, None),
                    Err(err) => (false, Some(err)),
                };

                let mut sample_tags = tags.clone();
                sample_tags.insert("check".to_string(), check.name.clone());
                self.recorder
                    .add(CHECKS, if passed { 1.0 } else { 0.0 }, sample_tags.clone());
                if let Some(err) = &error {
                    debug!(check = %check.name, error = %err, "check predicate errored");
                    self.recorder.add(CHECK_ERRORS, 1.0, sample_tags);
                    self.recorder
                        .note_error(&format!("check:{}", check.name), err.clone());
                }

                CheckResult {
                    name: check.name.clone(),
                    passed,
                    error,
                }
            })
            .collect()
    }
}
