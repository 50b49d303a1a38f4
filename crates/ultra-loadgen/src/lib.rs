// Numan Thabit 2025
#![forbid(unsafe_code)]
//! ultra-loadgen: staged HTTP load generator with checks and thresholds.

/// Named response assertions.
pub mod check;
/// CLI flags and TOML test definitions.
pub mod config;
/// Run orchestration.
pub mod engine;
/// Environment snapshot used for secrets and target urls.
pub mod env;
/// Error taxonomy.
pub mod error;
/// HTTP request/response boundary.
pub mod http;
/// Append-only metric store.
pub mod metrics;
/// End-of-run report.
pub mod report;
/// Stage plan and virtual user pool.
pub mod scheduler;
/// Prometheus engine counters.
pub mod telemetry;
/// `${var}` templates.
pub mod template;
/// Threshold expressions and evaluation.
pub mod threshold;
/// Request workflow and its runner.
pub mod workflow;

pub use config::{CliArgs, LoadTestConfig};
pub use engine::LoadTest;
pub use env::EnvSnapshot;
pub use report::RunReport;
