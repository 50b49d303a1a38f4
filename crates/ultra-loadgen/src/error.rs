// Numan Thabit 2025
//! Error taxonomy shared by the engine.

use std::time::Duration;

use thiserror::Error;

/// Fatal problems detected before any traffic is generated.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("base url is not configured (set `base_url`, --base-url or ${env})")]
    MissingBaseUrl { env: String },
    #[error("invalid base url '{url}': {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("required environment variable {env} for credential '{name}' is not set")]
    MissingCredential { name: String, env: String },
    #[error("at least one stage must be configured")]
    NoStages,
    #[error("workflow has no steps")]
    NoSteps,
    #[error("max_vus must be greater than 0")]
    ZeroVuCap,
    #[error("ramp_tick must be greater than 0")]
    ZeroRampTick,
    #[error("step {index} ({step}): {reason}")]
    InvalidStep {
        index: usize,
        step: String,
        reason: String,
    },
    #[error("threshold on '{metric}': {source}")]
    InvalidThreshold {
        metric: String,
        #[source]
        source: ThresholdParseError,
    },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid duration '{value}': {source}")]
    InvalidDuration {
        value: String,
        #[source]
        source: humantime::DurationError,
    },
}

/// Failure at the HTTP boundary. Always terminal for the step that raised it.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid request: {0}")]
    Build(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Short label used as the `reason` tag on aborted iterations.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Connect(_) => "connect",
            TransportError::Timeout(_) => "timeout",
            TransportError::Build(_) => "build",
            TransportError::Request(_) => "transport",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThresholdParseError {
    #[error("empty threshold expression")]
    Empty,
    #[error("missing comparison operator in '{0}'")]
    MissingOperator(String),
    #[error("unknown aggregation '{0}'")]
    UnknownStat(String),
    #[error("invalid percentile '{0}'")]
    InvalidPercentile(String),
    #[error("invalid threshold value '{0}'")]
    InvalidValue(String),
    #[error("invalid tag filter '{0}'")]
    InvalidTagFilter(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unterminated variable reference in '{0}'")]
    Unterminated(String),
    #[error("empty variable name in '{0}'")]
    EmptyName(String),
    #[error("undefined variable '{0}'")]
    Undefined(String),
}
