// Numan Thabit 2025
//! Wires configuration, recorder, client, scheduler and thresholds into one run.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::LoadTestConfig;
use crate::http::{HttpClient, ReqwestClient};
use crate::metrics::MetricRecorder;
use crate::report::RunReport;
use crate::scheduler::{SchedulerConfig, StageScheduler};
use crate::telemetry::EngineMetrics;
use crate::template::Vars;
use crate::threshold::ThresholdEvaluator;
use crate::workflow::WorkflowRunner;

pub struct LoadTest {
    config: LoadTestConfig,
    recorder: Arc<MetricRecorder>,
    telemetry: Arc<EngineMetrics>,
}

impl LoadTest {
    pub fn new(config: LoadTestConfig) -> Result<Self> {
        let recorder = Arc::new(MetricRecorder::new(config.tags.clone()));
        let telemetry = Arc::new(EngineMetrics::new()?);
        Ok(Self {
            config,
            recorder,
            telemetry,
        })
    }

    pub fn config(&self) -> &LoadTestConfig {
        &self.config
    }

    pub fn recorder(&self) -> Arc<MetricRecorder> {
        self.recorder.clone()
    }

    pub fn telemetry(&self) -> Arc<EngineMetrics> {
        self.telemetry.clone()
    }

    /// Run against the configured target with a shared `reqwest` client.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport> {
        let pool = self.config.max_vus as usize;
        let client = Arc::new(ReqwestClient::new(self.config.request_timeout, pool)?);
        self.run_with_client(client, cancel).await
    }

    /// Execute the stage plan to completion or cancellation and build the
    /// report. A report is returned for every run that reached the scheduler.
    pub async fn run_with_client<C: HttpClient>(
        &self,
        client: Arc<C>,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let config = &self.config;
        let stop = cancel.child_token();
        let background = CancellationToken::new();

        let mut globals = Vars::new();
        globals.insert("base_url".to_string(), Value::from(config.base_url.clone()));
        for (name, value) in config.credentials.iter() {
            globals.insert(name.to_string(), Value::from(value));
        }

        let runner = Arc::new(
            WorkflowRunner::new(
                Arc::new(config.workflow.clone()),
                client,
                self.recorder.clone(),
                globals,
            )
            .with_telemetry(self.telemetry.clone()),
        );
        let scheduler = StageScheduler::new(
            runner,
            SchedulerConfig {
                plan: config.plan.clone(),
                max_vus: config.max_vus,
                tick: config.ramp_tick,
                graceful_stop: config.graceful_stop,
            },
        )
        .with_telemetry(self.telemetry.clone());

        if let Some(limit) = config.run_timeout {
            let stop = stop.clone();
            let done = background.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = done.cancelled() => {}
                    _ = sleep(limit) => {
                        warn!(run_timeout = %humantime::format_duration(limit), "run timeout reached");
                        stop.cancel();
                    }
                }
            });
        }

        let metrics_server = config.metrics_bind.map(|addr| {
            let telemetry = self.telemetry.clone();
            let shutdown = background.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_metrics(addr, telemetry, shutdown).await {
                    error!(error = %err, "metrics endpoint failed");
                }
            })
        });

        let evaluator = Arc::new(ThresholdEvaluator::new(config.thresholds.clone()));
        let watcher = tokio::spawn(evaluator.clone().watch(
            self.recorder.clone(),
            config.threshold_interval,
            background.clone(),
            stop.clone(),
        ));

        let started_at = OffsetDateTime::now_utc();
        info!(name = %config.name, target = %config.base_url, "load test starting");
        let summary = scheduler.run(stop).await;

        background.cancel();
        if let Err(err) = watcher.await {
            warn!(error = %err, "threshold watcher task failed");
        }
        if let Some(handle) = metrics_server {
            if let Err(err) = handle.await {
                warn!(error = %err, "metrics endpoint task failed");
            }
        }

        let outcomes = evaluator.evaluate(&self.recorder);
        let report = RunReport::build(&config.name, started_at, &summary, &self.recorder, outcomes);
        report.log();

        if let Some(path) = &config.report_json {
            match report.write_json(path) {
                Ok(()) => info!(path = %path.display(), "report written"),
                Err(err) => error!(path = %path.display(), error = %format!("{err:#}"), "failed to persist report"),
            }
        }
        Ok(report)
    }
}

/// Serve the live engine counters on `/metrics` until `shutdown` fires.
pub async fn serve_metrics(
    addr: SocketAddr,
    telemetry: Arc<EngineMetrics>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(telemetry);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics socket {addr}"))?;
    info!(%addr, "metrics endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("metrics server exited with error")?;
    Ok(())
}

async fn metrics_handler(State(telemetry): State<Arc<EngineMetrics>>) -> Response {
    match telemetry.render() {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, telemetry.content_type())
            .body(Body::from(body))
            .unwrap_or_else(|err| plain(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
        Err(err) => {
            error!(error = %err, "failed to render metrics");
            plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoder failure".to_string(),
            )
        }
    }
}

fn plain(status: StatusCode, message: String) -> Response {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}
