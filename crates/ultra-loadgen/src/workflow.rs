// Numan Thabit 2025
//! Scripted per-user workflow and the runner executing one iteration of it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::check::{Check, CheckEvaluator};
use crate::error::{ConfigError, TemplateError, TransportError};
use crate::http::{HttpClient, HttpRequest, Response};
use crate::metrics::{
    tags, MetricRecorder, Tags, HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED, ITERATIONS,
    ITERATIONS_ABORTED, ITERATION_DURATION,
};
use crate::scheduler::{IterationOutcome, IterationRunner};
use crate::telemetry::EngineMetrics;
use crate::template::{JsonTemplate, Template, Vars};

/// Variables bound by the runner for every iteration.
pub const BUILTIN_VARS: [&str; 3] = ["base_url", "vu", "iteration"];

#[derive(Debug, Clone)]
pub enum Body {
    Text(Template),
    Json(JsonTemplate),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractSource {
    /// JSON pointer into the response body.
    Pointer(String),
    /// First present, non-null entry. Entries starting with `/` are pointers,
    /// anything else is a top-level field name.
    Fields(Vec<String>),
    Header(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extract {
    pub var: String,
    pub source: ExtractSource,
    pub required: bool,
}

impl Extract {
    pub fn apply(&self, response: &Response) -> Option<Value> {
        match &self.source {
            ExtractSource::Header(name) => response
                .header(name)
                .map(|value| Value::String(value.to_string())),
            ExtractSource::Pointer(pointer) => {
                let doc = response.json().ok()?;
                doc.pointer(pointer).filter(|v| !v.is_null()).cloned()
            }
            ExtractSource::Fields(fields) => {
                let doc = response.json().ok()?;
                fields.iter().find_map(|field| {
                    let found = if field.starts_with('/') {
                        doc.pointer(field)
                    } else {
                        doc.get(field.as_str())
                    };
                    found.filter(|v| !v.is_null()).cloned()
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestStep {
    pub name: String,
    pub method: Method,
    pub url: Template,
    pub headers: Vec<(String, Template)>,
    pub body: Option<Body>,
    pub timeout: Option<Duration>,
    /// When non-empty, any other status aborts the iteration.
    pub expect_status: Vec<u16>,
    pub checks: Vec<Check>,
    pub extract: Vec<Extract>,
}

impl RequestStep {
    fn variables(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.url.variables().collect();
        for (_, value) in &self.headers {
            names.extend(value.variables());
        }
        match &self.body {
            Some(Body::Text(template)) => names.extend(template.variables()),
            Some(Body::Json(template)) => names.extend(template.variables()),
            None => {}
        }
        names
    }

    fn render(&self, vars: &Vars) -> Result<HttpRequest, TemplateError> {
        let mut headers = BTreeMap::new();
        for (name, value) in &self.headers {
            headers.insert(name.to_ascii_lowercase(), value.render(vars)?);
        }
        let body = match &self.body {
            Some(Body::Text(template)) => Some(Bytes::from(template.render(vars)?)),
            Some(Body::Json(template)) => {
                headers
                    .entry("content-type".to_string())
                    .or_insert_with(|| "application/json".to_string());
                Some(Bytes::from(template.render(vars)?.to_string()))
            }
            None => None,
        };
        Ok(HttpRequest {
            method: self.method.clone(),
            url: self.url.render(vars)?,
            headers,
            body,
            timeout: self.timeout,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CheckStep {
    pub name: String,
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone)]
pub enum Step {
    Request(RequestStep),
    Check(CheckStep),
    Pause(Duration),
}

impl Step {
    pub fn label(&self) -> String {
        match self {
            Step::Request(req) => format!("request {}", req.name),
            Step::Check(check) => format!("check {}", check.name),
            Step::Pause(duration) => format!("pause {}", humantime::format_duration(*duration)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Workflow {
    steps: Vec<Step>,
}

impl Workflow {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Reject workflows that could only fail at runtime: references to
    /// variables not bound at that step and checks with no response to read.
    pub fn validate<'a, I>(&self, globals: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        if self.steps.is_empty() {
            return Err(ConfigError::NoSteps);
        }
        let mut bound: HashSet<String> = BUILTIN_VARS.iter().map(|v| v.to_string()).collect();
        bound.extend(globals.into_iter().map(str::to_string));
        let mut seen_request = false;

        for (index, step) in self.steps.iter().enumerate() {
            let invalid = |reason: String| ConfigError::InvalidStep {
                index,
                step: step.label(),
                reason,
            };
            match step {
                Step::Request(req) => {
                    if let Some(missing) = req.variables().into_iter().find(|v| !bound.contains(*v))
                    {
                        return Err(invalid(format!(
                            "variable '{missing}' is not defined before this step"
                        )));
                    }
                    bound.extend(req.extract.iter().map(|e| e.var.clone()));
                    seen_request = true;
                }
                Step::Check(_) if !seen_request => {
                    return Err(invalid("check step has no preceding request".to_string()));
                }
                Step::Check(_) | Step::Pause(_) => {}
            }
        }
        Ok(())
    }
}

enum StepFailure {
    Transport(TransportError),
    Render(TemplateError),
}

/// Executes workflow iterations for any virtual user.
pub struct WorkflowRunner<C: HttpClient> {
    workflow: Arc<Workflow>,
    client: Arc<C>,
    recorder: Arc<MetricRecorder>,
    checks: CheckEvaluator,
    globals: Vars,
    telemetry: Option<Arc<EngineMetrics>>,
}

impl<C: HttpClient> WorkflowRunner<C> {
    /// `globals` must already hold `base_url` and every credential.
    pub fn new(
        workflow: Arc<Workflow>,
        client: Arc<C>,
        recorder: Arc<MetricRecorder>,
        globals: Vars,
    ) -> Self {
        Self {
            workflow,
            client,
            checks: CheckEvaluator::new(recorder.clone()),
            recorder,
            globals,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<EngineMetrics>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub async fn run_once(&self, vu: u64, iteration: u64) -> IterationOutcome {
        let started = Instant::now();
        let mut vars = self.globals.clone();
        vars.insert("vu".to_string(), Value::from(vu));
        vars.insert("iteration".to_string(), Value::from(iteration));
        let mut last: Option<Response> = None;

        for step in self.workflow.steps() {
            match step {
                Step::Request(req) => {
                    let response = match self.execute(req, &vars).await {
                        Ok(response) => response,
                        Err(StepFailure::Transport(err)) => {
                            debug!(vu, step = %req.name, error = %err, "transport failure; aborting iteration");
                            return self.abort(err.kind(), &req.name, err.to_string());
                        }
                        Err(StepFailure::Render(err)) => {
                            return self.abort("render_failed", &req.name, err.to_string());
                        }
                    };

                    self.checks
                        .evaluate(&response, &req.checks, &tags([("name", req.name.as_str())]));

                    if !req.expect_status.is_empty() && !req.expect_status.contains(&response.status)
                    {
                        return self.abort(
                            "unexpected_status",
                            &req.name,
                            format!("status {} not in {:?}", response.status, req.expect_status),
                        );
                    }

                    for extract in &req.extract {
                        match extract.apply(&response) {
                            Some(value) => {
                                vars.insert(extract.var.clone(), value);
                            }
                            None if !extract.required => {
                                vars.insert(extract.var.clone(), Value::Null);
                            }
                            None => {
                                return self.abort(
                                    "extract_failed",
                                    &req.name,
                                    format!("could not extract '{}'", extract.var),
                                );
                            }
                        }
                    }
                    last = Some(response);
                }
                Step::Check(step) => {
                    if let Some(response) = &last {
                        self.checks
                            .evaluate(response, &step.checks, &tags([("name", step.name.as_str())]));
                    }
                }
                Step::Pause(duration) => sleep(*duration).await,
            }
        }

        self.recorder.add(ITERATIONS, 1.0, Tags::new());
        self.recorder.add(
            ITERATION_DURATION,
            started.elapsed().as_secs_f64() * 1_000.0,
            Tags::new(),
        );
        IterationOutcome::Completed
    }

    async fn execute(&self, req: &RequestStep, vars: &Vars) -> Result<Response, StepFailure> {
        let request = req.render(vars).map_err(StepFailure::Render)?;
        let method = request.method.to_string();
        let result = self.client.send(request).await;

        let (status, failed) = match &result {
            Ok(response) => (response.status.to_string(), response.status >= 400),
            Err(_) => ("0".to_string(), true),
        };
        let sample_tags = tags([
            ("name", req.name.as_str()),
            ("method", method.as_str()),
            ("status", status.as_str()),
        ]);
        self.recorder.add(HTTP_REQS, 1.0, sample_tags.clone());
        self.recorder
            .add(HTTP_REQ_FAILED, if failed { 1.0 } else { 0.0 }, sample_tags.clone());
        if let Some(telemetry) = &self.telemetry {
            let latency = result.as_ref().ok().map(|response| response.timing);
            telemetry.record_request(&req.name, latency, failed);
        }

        let response = result.map_err(StepFailure::Transport)?;
        self.recorder.add(
            HTTP_REQ_DURATION,
            response.timing.as_secs_f64() * 1_000.0,
            sample_tags,
        );
        Ok(response)
    }

    fn abort(&self, reason: &str, step: &str, message: String) -> IterationOutcome {
        self.recorder
            .add(ITERATIONS_ABORTED, 1.0, tags([("reason", reason), ("step", step)]));
        self.recorder
            .note_error(&format!("iteration:{reason}"), format!("{step}: {message}"));
        IterationOutcome::Aborted {
            reason: reason.to_string(),
        }
    }
}

impl<C: HttpClient> IterationRunner for WorkflowRunner<C> {
    async fn run_iteration(&self, vu: u64, iteration: u64) -> IterationOutcome {
        self.run_once(vu, iteration).await
    }

    fn on_interrupted(&self, _vu: u64) {
        self.recorder.add(
            ITERATIONS_ABORTED,
            1.0,
            tags([("reason", "interrupted"), ("step", "")]),
        );
    }
}
