// Numan Thabit 2025
use std::{
    collections::BTreeMap,
    fmt, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use url::Url;

use crate::check::{Check, CheckKind};
use crate::env::EnvSnapshot;
use crate::error::ConfigError;
use crate::metrics::Tags;
use crate::scheduler::{Stage, StagePlan};
use crate::template::{JsonTemplate, Template};
use crate::threshold::ThresholdSpec;
use crate::workflow::{Body, CheckStep, Extract, ExtractSource, RequestStep, Step, Workflow};

const DEFAULT_CONFIG_PATH: &str = "ops/ultra-loadgen.toml";
const DEFAULT_NAME: &str = "ultra-loadgen";
const DEFAULT_BASE_URL_ENV: &str = "BASE_URL";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
const DEFAULT_RAMP_TICK: Duration = Duration::from_millis(100);
const DEFAULT_THRESHOLD_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_TOKEN_FIELDS: [&str; 4] = ["token", "accessToken", "access_token", "jwt"];

#[derive(Parser, Debug, Clone, Default)]
#[command(
    author,
    version,
    about = "Staged HTTP load generator with checks and thresholds",
    rename_all = "kebab-case"
)]
pub struct CliArgs {
    /// Path to a TOML test definition.
    #[arg(long, value_name = "PATH", env = "ULTRA_LOADGEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Target base URL; overrides the file and the base url environment variable.
    #[arg(long)]
    pub base_url: Option<String>,

    /// Upper bound on concurrently active virtual users.
    #[arg(long)]
    pub max_vus: Option<u32>,

    /// Per-request timeout (e.g. "10s").
    #[arg(long, value_parser = humantime::parse_duration)]
    pub request_timeout: Option<Duration>,

    /// Stop the run after this long regardless of the stage plan.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub run_timeout: Option<Duration>,

    /// Grace period for in-flight iterations once the run stops.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub graceful_stop: Option<Duration>,

    /// Write the final report as JSON to this path.
    #[arg(long, value_name = "PATH")]
    pub report_json: Option<PathBuf>,

    /// Serve Prometheus metrics on this address while the run is active.
    #[arg(long)]
    pub metrics_bind: Option<SocketAddr>,

    /// Validate the configuration and exit without generating traffic.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

/// Resolved credential values. Debug output never includes the secrets.
#[derive(Clone, Default)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

#[derive(Debug, Clone)]
pub struct LoadTestConfig {
    pub name: String,
    pub base_url: String,
    pub plan: StagePlan,
    pub max_vus: u32,
    pub thresholds: Vec<ThresholdSpec>,
    pub tags: Tags,
    pub credentials: Credentials,
    pub workflow: Workflow,
    pub request_timeout: Duration,
    pub run_timeout: Option<Duration>,
    pub graceful_stop: Duration,
    pub ramp_tick: Duration,
    pub threshold_interval: Duration,
    pub report_json: Option<PathBuf>,
    pub metrics_bind: Option<SocketAddr>,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    name: Option<String>,
    base_url: Option<String>,
    base_url_env: Option<String>,
    start_vus: Option<u32>,
    max_vus: Option<u32>,
    #[serde(default)]
    stages: Vec<RawStage>,
    #[serde(default)]
    thresholds: BTreeMap<String, RawThresholds>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    credentials: BTreeMap<String, String>,
    token_fields: Option<Vec<String>>,
    request_timeout: Option<String>,
    run_timeout: Option<String>,
    graceful_stop: Option<String>,
    ramp_tick: Option<String>,
    threshold_interval: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawStage {
    duration: String,
    target: u32,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawThresholds {
    One(RawThreshold),
    Many(Vec<RawThreshold>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawThreshold {
    Expr(String),
    Detailed {
        condition: String,
        #[serde(default)]
        abort_on_fail: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawStep {
    Request(RawRequest),
    Check {
        name: Option<String>,
        checks: Vec<RawCheck>,
    },
    Pause {
        duration: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRequest {
    name: Option<String>,
    method: Option<String>,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    body: Option<String>,
    json: Option<Value>,
    timeout: Option<String>,
    #[serde(default)]
    expect_status: Vec<u16>,
    #[serde(default)]
    checks: Vec<RawCheck>,
    #[serde(default)]
    extract: Vec<RawExtract>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawJsonEquals {
    pointer: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCheck {
    name: String,
    status: Option<OneOrMany<u16>>,
    body_contains: Option<String>,
    json_exists: Option<String>,
    json_equals: Option<RawJsonEquals>,
    max_duration: Option<String>,
    header_present: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawExtract {
    var: String,
    pointer: Option<String>,
    fields: Option<Vec<String>>,
    #[serde(default)]
    token: bool,
    header: Option<String>,
    #[serde(default = "default_required")]
    required: bool,
}

fn default_required() -> bool {
    true
}

impl LoadTestConfig {
    /// Resolve the run definition from CLI flags, the config file and the
    /// environment snapshot. Nothing here touches the network.
    pub fn from_cli(cli: &CliArgs, env: &EnvSnapshot) -> Result<Self, ConfigError> {
        let file_cfg = load_file_config(cli.config.as_deref())?;
        let config = merge(cli, file_cfg, env)?;
        config.log_summary();
        Ok(config)
    }

    /// Same as [`LoadTestConfig::from_cli`] with the file contents supplied inline.
    pub fn from_toml_str(
        text: &str,
        cli: &CliArgs,
        env: &EnvSnapshot,
    ) -> Result<Self, ConfigError> {
        let file_cfg = parse_file_config(text, "<inline>")?;
        merge(cli, Some((PathBuf::from("<inline>"), file_cfg)), env)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.plan.stages().is_empty() {
            return Err(ConfigError::NoStages);
        }
        if self.max_vus == 0 {
            return Err(ConfigError::ZeroVuCap);
        }
        if self.ramp_tick.is_zero() {
            return Err(ConfigError::ZeroRampTick);
        }
        self.workflow.validate(self.credentials.names())
    }

    pub fn log_summary(&self) {
        info!(
            name = %self.name,
            base_url = %self.base_url,
            config = ?self.config_path,
            stages = self.plan.stages().len(),
            planned = %humantime::format_duration(self.plan.total_duration()),
            peak_vus = self.plan.peak(),
            max_vus = self.max_vus,
            steps = self.workflow.steps().len(),
            thresholds = self.thresholds.len(),
            credentials = ?self.credentials,
            request_timeout = %humantime::format_duration(self.request_timeout),
            run_timeout = ?self.run_timeout,
            graceful_stop = %humantime::format_duration(self.graceful_stop),
            "ultra-loadgen configuration"
        );
    }
}

fn merge(
    cli: &CliArgs,
    file_cfg: Option<(PathBuf, FileConfig)>,
    env: &EnvSnapshot,
) -> Result<LoadTestConfig, ConfigError> {
    let (config_path, file_cfg) = file_cfg.unzip();
    let file_cfg = file_cfg.unwrap_or_default();

    let base_url_env = file_cfg
        .base_url_env
        .clone()
        .unwrap_or_else(|| DEFAULT_BASE_URL_ENV.to_string());
    let base_url = resolve_base_url(
        cli.base_url.as_deref(),
        env.get(&base_url_env),
        file_cfg.base_url.as_deref(),
        &base_url_env,
    )?;

    let mut credentials = BTreeMap::new();
    for (name, env_name) in &file_cfg.credentials {
        let value = env
            .get(env_name)
            .ok_or_else(|| ConfigError::MissingCredential {
                name: name.clone(),
                env: env_name.clone(),
            })?;
        credentials.insert(name.clone(), value.to_string());
    }

    let stages = file_cfg
        .stages
        .iter()
        .map(|stage| parse_duration(&stage.duration).map(|d| Stage::new(d, stage.target)))
        .collect::<Result<Vec<_>, ConfigError>>()?;
    let plan = StagePlan::new(file_cfg.start_vus.unwrap_or(0), stages);
    let max_vus = pick(cli.max_vus, file_cfg.max_vus, plan.peak().max(1));

    let mut thresholds = Vec::new();
    for (key, raw) in &file_cfg.thresholds {
        let entries = match raw {
            RawThresholds::One(one) => std::slice::from_ref(one),
            RawThresholds::Many(many) => many.as_slice(),
        };
        for entry in entries {
            let (expr, abort_on_fail) = match entry {
                RawThreshold::Expr(expr) => (expr.as_str(), false),
                RawThreshold::Detailed {
                    condition,
                    abort_on_fail,
                } => (condition.as_str(), *abort_on_fail),
            };
            let spec = ThresholdSpec::parse(key, expr, abort_on_fail).map_err(|source| {
                ConfigError::InvalidThreshold {
                    metric: key.clone(),
                    source,
                }
            })?;
            thresholds.push(spec);
        }
    }

    let token_fields = file_cfg
        .token_fields
        .clone()
        .unwrap_or_else(|| DEFAULT_TOKEN_FIELDS.iter().map(|f| f.to_string()).collect());
    let steps = file_cfg
        .steps
        .into_iter()
        .enumerate()
        .map(|(index, raw)| build_step(index, raw, &file_cfg.headers, &token_fields))
        .collect::<Result<Vec<_>, ConfigError>>()?;

    let config = LoadTestConfig {
        name: file_cfg.name.unwrap_or_else(|| DEFAULT_NAME.to_string()),
        base_url,
        plan,
        max_vus,
        thresholds,
        tags: file_cfg.tags,
        credentials: Credentials(credentials),
        workflow: Workflow::new(steps),
        request_timeout: pick(
            cli.request_timeout,
            parse_optional(file_cfg.request_timeout.as_deref())?,
            DEFAULT_REQUEST_TIMEOUT,
        ),
        run_timeout: cli
            .run_timeout
            .or(parse_optional(file_cfg.run_timeout.as_deref())?),
        graceful_stop: pick(
            cli.graceful_stop,
            parse_optional(file_cfg.graceful_stop.as_deref())?,
            DEFAULT_GRACEFUL_STOP,
        ),
        ramp_tick: parse_optional(file_cfg.ramp_tick.as_deref())?.unwrap_or(DEFAULT_RAMP_TICK),
        threshold_interval: parse_optional(file_cfg.threshold_interval.as_deref())?
            .unwrap_or(DEFAULT_THRESHOLD_INTERVAL),
        report_json: cli.report_json.clone(),
        metrics_bind: cli.metrics_bind,
        config_path,
    };
    config.validate()?;
    Ok(config)
}

/// CLI flag, then the named environment variable, then the file.
fn resolve_base_url(
    cli: Option<&str>,
    env: Option<&str>,
    file: Option<&str>,
    env_name: &str,
) -> Result<String, ConfigError> {
    let raw = cli
        .or(env)
        .or(file)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::MissingBaseUrl {
            env: env_name.to_string(),
        })?;
    Url::parse(raw).map_err(|source| ConfigError::InvalidBaseUrl {
        url: raw.to_string(),
        source,
    })?;
    Ok(raw.trim_end_matches('/').to_string())
}

fn build_step(
    index: usize,
    raw: RawStep,
    default_headers: &BTreeMap<String, String>,
    token_fields: &[String],
) -> Result<Step, ConfigError> {
    let invalid = |step: &str, reason: String| ConfigError::InvalidStep {
        index,
        step: step.to_string(),
        reason,
    };

    match raw {
        RawStep::Pause { duration } => Ok(Step::Pause(parse_duration(&duration)?)),
        RawStep::Check { name, checks } => {
            let name = name.unwrap_or_else(|| format!("check-{index}"));
            let checks = checks
                .into_iter()
                .map(build_check)
                .collect::<Result<Vec<_>, String>>()
                .map_err(|reason| invalid(&name, reason))?;
            Ok(Step::Check(CheckStep { name, checks }))
        }
        RawStep::Request(req) => {
            let name = req.name.clone().unwrap_or_else(|| req.url.clone());
            let label = format!("request {name}");

            let method = req.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
            let method = Method::from_bytes(method.as_bytes())
                .map_err(|err| invalid(&label, format!("invalid method: {err}")))?;

            let url = Template::parse(&join_base(&req.url))
                .map_err(|err| invalid(&label, err.to_string()))?;

            let mut merged: BTreeMap<String, (String, String)> = default_headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), (k.clone(), v.clone())))
                .collect();
            for (k, v) in &req.headers {
                merged.insert(k.to_ascii_lowercase(), (k.clone(), v.clone()));
            }
            let headers = merged
                .into_values()
                .map(|(k, v)| Template::parse(&v).map(|t| (k, t)))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| invalid(&label, err.to_string()))?;

            let body = match (req.body, req.json) {
                (Some(_), Some(_)) => {
                    return Err(invalid(&label, "set either body or json, not both".into()))
                }
                (Some(text), None) => Some(Body::Text(
                    Template::parse(&text).map_err(|err| invalid(&label, err.to_string()))?,
                )),
                (None, Some(json)) => Some(Body::Json(
                    JsonTemplate::compile(&json).map_err(|err| invalid(&label, err.to_string()))?,
                )),
                (None, None) => None,
            };

            let checks = req
                .checks
                .into_iter()
                .map(build_check)
                .collect::<Result<Vec<_>, String>>()
                .map_err(|reason| invalid(&label, reason))?;
            let extract = req
                .extract
                .into_iter()
                .map(|raw| build_extract(raw, token_fields))
                .collect::<Result<Vec<_>, String>>()
                .map_err(|reason| invalid(&label, reason))?;

            Ok(Step::Request(RequestStep {
                name,
                method,
                url,
                headers,
                body,
                timeout: parse_optional(req.timeout.as_deref())?,
                expect_status: req.expect_status,
                checks,
                extract,
            }))
        }
    }
}

/// Paths are resolved against `${base_url}`; absolute urls and urls that start
/// with a variable are kept as written.
fn join_base(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") || url.starts_with("${") {
        url.to_string()
    } else if url.starts_with('/') {
        format!("${{base_url}}{url}")
    } else {
        format!("${{base_url}}/{url}")
    }
}

fn build_check(raw: RawCheck) -> Result<Check, String> {
    let RawCheck {
        name,
        status,
        body_contains,
        json_exists,
        json_equals,
        max_duration,
        header_present,
    } = raw;

    let mut kinds = Vec::new();
    if let Some(status) = status {
        kinds.push(CheckKind::Status(status.into_vec()));
    }
    if let Some(needle) = body_contains {
        kinds.push(CheckKind::BodyContains(needle));
    }
    if let Some(pointer) = json_exists {
        kinds.push(CheckKind::JsonExists(pointer));
    }
    if let Some(RawJsonEquals { pointer, value }) = json_equals {
        kinds.push(CheckKind::JsonEquals { pointer, value });
    }
    if let Some(limit) = max_duration {
        let limit = humantime::parse_duration(&limit)
            .map_err(|err| format!("check '{name}': invalid max_duration '{limit}': {err}"))?;
        kinds.push(CheckKind::MaxDuration(limit));
    }
    if let Some(header) = header_present {
        kinds.push(CheckKind::HeaderPresent(header));
    }

    match kinds.len() {
        1 => Ok(kinds.remove(0).into_check(name)),
        0 => Err(format!("check '{name}' has no predicate")),
        _ => Err(format!("check '{name}' sets more than one predicate")),
    }
}

fn build_extract(raw: RawExtract, token_fields: &[String]) -> Result<Extract, String> {
    let mut sources = Vec::new();
    if let Some(pointer) = raw.pointer {
        sources.push(ExtractSource::Pointer(pointer));
    }
    if let Some(fields) = raw.fields {
        sources.push(ExtractSource::Fields(fields));
    }
    if raw.token {
        sources.push(ExtractSource::Fields(token_fields.to_vec()));
    }
    if let Some(header) = raw.header {
        sources.push(ExtractSource::Header(header));
    }

    match sources.len() {
        1 => Ok(Extract {
            var: raw.var,
            source: sources.remove(0),
            required: raw.required,
        }),
        0 => Err(format!("extract '{}' has no source", raw.var)),
        _ => Err(format!("extract '{}' sets more than one source", raw.var)),
    }
}

fn pick<T: Clone>(cli: Option<T>, file: Option<T>, default: T) -> T {
    cli.or(file).unwrap_or(default)
}

fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|source| ConfigError::InvalidDuration {
        value: value.to_string(),
        source,
    })
}

fn parse_optional(value: Option<&str>) -> Result<Option<Duration>, ConfigError> {
    value.map(parse_duration).transpose()
}

fn load_file_config(path: Option<&Path>) -> Result<Option<(PathBuf, FileConfig)>, ConfigError> {
    if let Some(path) = path {
        return read_config(path).map(|cfg| Some((path.to_path_buf(), cfg)));
    }

    let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        return read_config(&default_path).map(|cfg| Some((default_path, cfg)));
    }

    Ok(None)
}

fn read_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_file_config(&data, &path.display().to_string())
}

fn parse_file_config(data: &str, origin: &str) -> Result<FileConfig, ConfigError> {
    toml::from_str(data).map_err(|source| ConfigError::Parse {
        path: origin.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [[stages]]
        duration = "10s"
        target = 2

        [[steps]]
        kind = "request"
        url = "/health"
    "#;

    fn env(pairs: &[(&str, &str)]) -> EnvSnapshot {
        EnvSnapshot::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn missing_base_url_is_fatal() {
        let err = LoadTestConfig::from_toml_str(MINIMAL, &CliArgs::default(), &env(&[]))
            .expect_err("no base url anywhere");
        assert!(matches!(err, ConfigError::MissingBaseUrl { ref env } if env == "BASE_URL"));
    }

    #[test]
    fn base_url_precedence_is_cli_then_env_then_file() {
        let text = format!("base_url = \"http://file.test\"\n{MINIMAL}");
        let env = env(&[("BASE_URL", "http://env.test/")]);

        let cfg = LoadTestConfig::from_toml_str(&text, &CliArgs::default(), &env).expect("env");
        assert_eq!(cfg.base_url, "http://env.test");

        let cli = CliArgs {
            base_url: Some("http://cli.test".into()),
            ..CliArgs::default()
        };
        let cfg = LoadTestConfig::from_toml_str(&text, &cli, &env).expect("cli");
        assert_eq!(cfg.base_url, "http://cli.test");

        let cfg = LoadTestConfig::from_toml_str(&text, &CliArgs::default(), &EnvSnapshot::default())
            .expect("file");
        assert_eq!(cfg.base_url, "http://file.test");
    }

    #[test]
    fn missing_credential_is_fatal_and_secrets_stay_out_of_debug() {
        let text = format!("[credentials]\ntoken = \"API_TOKEN\"\n{MINIMAL}");
        let err = LoadTestConfig::from_toml_str(
            &text,
            &CliArgs::default(),
            &env(&[("BASE_URL", "http://api.test")]),
        )
        .expect_err("API_TOKEN unset");
        assert!(matches!(err, ConfigError::MissingCredential { ref env, .. } if env == "API_TOKEN"));

        let cfg = LoadTestConfig::from_toml_str(
            &text,
            &CliArgs::default(),
            &env(&[("BASE_URL", "http://api.test"), ("API_TOKEN", "s3cret")]),
        )
        .expect("credential present");
        assert_eq!(cfg.credentials.len(), 1);
        assert!(!format!("{cfg:?}").contains("s3cret"));
    }

    #[test]
    fn steps_thresholds_and_defaults_resolve() {
        let text = r#"
            base_url = "http://api.test"
            max_vus = 4
            run_timeout = "5m"

            [tags]
            env = "staging"

            [headers]
            Accept = "application/json"

            [thresholds]
            http_req_duration = "p(95) < 1000ms"
            "http_req_failed{name:login}" = [{ condition = "rate < 0.1", abort_on_fail = true }, "count < 1000"]

            [[stages]]
            duration = "30s"
            target = 10

            [[steps]]
            kind = "request"
            name = "login"
            method = "post"
            url = "auth/login"
            json = { user = "demo" }
            expect_status = [200, 201]
            extract = [{ var = "token", token = true }]
            checks = [{ name = "logged in", status = 200 }]

            [[steps]]
            kind = "request"
            url = "/cart"
            headers = { accept = "text/plain", Authorization = "Bearer ${token}" }

            [[steps]]
            kind = "pause"
            duration = "1s"
        "#;
        let cfg = LoadTestConfig::from_toml_str(text, &CliArgs::default(), &EnvSnapshot::default())
            .expect("valid config");

        assert_eq!(cfg.max_vus, 4);
        assert_eq!(cfg.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(cfg.run_timeout, Some(Duration::from_secs(300)));
        assert_eq!(cfg.tags.get("env").map(String::as_str), Some("staging"));
        assert_eq!(cfg.thresholds.len(), 3);
        assert!(cfg
            .thresholds
            .iter()
            .any(|t| t.abort_on_fail && t.metric == "http_req_failed"));

        let steps = cfg.workflow.steps();
        assert_eq!(steps.len(), 3);
        let Step::Request(login) = &steps[0] else {
            panic!("first step should be a request");
        };
        assert_eq!(login.method, Method::POST);
        assert_eq!(login.url.as_str(), "${base_url}/auth/login");
        assert_eq!(
            login.extract[0].source,
            ExtractSource::Fields(DEFAULT_TOKEN_FIELDS.iter().map(|f| f.to_string()).collect())
        );
        let Step::Request(cart) = &steps[1] else {
            panic!("second step should be a request");
        };
        assert_eq!(cart.name, "/cart");
        let accept: Vec<&str> = cart
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("accept"))
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(accept, vec!["text/plain"]);
        assert!(matches!(steps[2], Step::Pause(d) if d == Duration::from_secs(1)));
    }

    #[test]
    fn undefined_variables_are_rejected_before_traffic() {
        let text = r#"
            base_url = "http://api.test"

            [[stages]]
            duration = "10s"
            target = 1

            [[steps]]
            kind = "request"
            url = "/cart"
            headers = { Authorization = "Bearer ${token}" }
        "#;
        let err = LoadTestConfig::from_toml_str(text, &CliArgs::default(), &EnvSnapshot::default())
            .expect_err("token never bound");
        assert!(matches!(err, ConfigError::InvalidStep { index: 0, .. }));
    }

    #[test]
    fn invalid_thresholds_and_checks_are_reported() {
        let text = format!(
            "base_url = \"http://api.test\"\n[thresholds]\nhttp_req_duration = \"p95 1000\"\n{MINIMAL}"
        );
        let err = LoadTestConfig::from_toml_str(&text, &CliArgs::default(), &EnvSnapshot::default())
            .expect_err("bad threshold");
        assert!(matches!(err, ConfigError::InvalidThreshold { .. }));

        let text = r#"
            base_url = "http://api.test"
            [[stages]]
            duration = "1s"
            target = 1
            [[steps]]
            kind = "request"
            url = "/"
            checks = [{ name = "both", status = 200, body_contains = "ok" }]
        "#;
        let err = LoadTestConfig::from_toml_str(text, &CliArgs::default(), &EnvSnapshot::default())
            .expect_err("two predicates");
        assert!(err.to_string().contains("more than one predicate"));
    }

    #[test]
    fn empty_stages_and_zero_cap_are_rejected() {
        let text = r#"
            base_url = "http://api.test"
            [[steps]]
            kind = "pause"
            duration = "1s"
        "#;
        let err = LoadTestConfig::from_toml_str(text, &CliArgs::default(), &EnvSnapshot::default())
            .expect_err("no stages");
        assert!(matches!(err, ConfigError::NoStages));

        let cli = CliArgs {
            max_vus: Some(0),
            base_url: Some("http://api.test".into()),
            ..CliArgs::default()
        };
        let err = LoadTestConfig::from_toml_str(MINIMAL, &cli, &EnvSnapshot::default())
            .expect_err("zero cap");
        assert!(matches!(err, ConfigError::ZeroVuCap));
    }

    #[test]
    fn zero_ramp_tick_is_rejected() {
        let cli = CliArgs {
            base_url: Some("http://api.test".into()),
            ..CliArgs::default()
        };
        let text = format!("ramp_tick = \"0s\"\n{MINIMAL}");
        let err = LoadTestConfig::from_toml_str(&text, &cli, &EnvSnapshot::default())
            .expect_err("zero tick");
        assert!(matches!(err, ConfigError::ZeroRampTick));

        let text = format!("ramp_tick = \"250ms\"\n{MINIMAL}");
        let config = LoadTestConfig::from_toml_str(&text, &cli, &EnvSnapshot::default())
            .expect("non-zero tick");
        assert_eq!(config.ramp_tick, Duration::from_millis(250));
    }

    #[test]
    fn misspelled_request_keys_are_rejected() {
        let cli = CliArgs {
            base_url: Some("http://api.test".into()),
            ..CliArgs::default()
        };
        let text = r#"
            [[stages]]
            duration = "10s"
            target = 2

            [[steps]]
            kind = "request"
            url = "/health"
            expect_staus = [200]
        "#;
        let err = LoadTestConfig::from_toml_str(text, &cli, &EnvSnapshot::default())
            .expect_err("unknown request key");
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("expect_staus"), "{err}");
    }
}
