// Numan Thabit 2025
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ultra_loadgen::{CliArgs, EnvSnapshot, LoadTest, LoadTestConfig};

/// Exit status when the run completed but at least one threshold failed.
const THRESHOLDS_FAILED: u8 = 99;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = CliArgs::parse();
    let env = EnvSnapshot::from_process();
    let config = LoadTestConfig::from_cli(&cli, &env).context("invalid load test configuration")?;

    if cli.dry_run {
        info!("dry run requested; configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }

    let test = LoadTest::new(config)?;
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            warn!(%err, "failed to install shutdown handler");
            return;
        }
        info!("shutdown signal received; stopping run");
        on_signal.cancel();
    });

    let report = test.run(cancel).await?;
    println!("{report}");

    if report.passed {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(THRESHOLDS_FAILED))
    }
}
