// Numan Thabit 2025
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use ultra_loadgen::error::ConfigError;
use ultra_loadgen::metrics::{HTTP_REQS, ITERATIONS_ABORTED};
use ultra_loadgen::{CliArgs, EnvSnapshot, LoadTest, LoadTestConfig};

#[derive(Clone, Default)]
struct Seen {
    hits: Arc<AtomicUsize>,
    auth: Arc<Mutex<Vec<String>>>,
    carts: Arc<Mutex<Vec<Value>>>,
}

async fn login(State(seen): State<Seen>) -> Json<Value> {
    seen.hits.fetch_add(1, Ordering::Relaxed);
    Json(json!({ "accessToken": "abc" }))
}

async fn products(
    State(seen): State<Seen>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    seen.hits.fetch_add(1, Ordering::Relaxed);
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    seen.auth.lock().push(auth.clone());
    if auth != "Bearer abc" {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(json!([{ "id": 7, "name": "lamp" }])))
}

async fn cart(State(seen): State<Seen>, Json(body): Json<Value>) -> StatusCode {
    seen.hits.fetch_add(1, Ordering::Relaxed);
    seen.carts.lock().push(body);
    StatusCode::CREATED
}

async fn broken(State(seen): State<Seen>) -> StatusCode {
    seen.hits.fetch_add(1, Ordering::Relaxed);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn spawn_api(seen: Seen) -> SocketAddr {
    let app = Router::new()
        .route("/login", post(login))
        .route("/products", get(products))
        .route("/cart", post(cart))
        .route("/broken", get(broken))
        .with_state(seen);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock api");
    let addr = listener.local_addr().expect("mock api addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock api server");
    });
    addr
}

const SHOP_FLOW: &str = r#"
name = "shop"
ramp_tick = "20ms"
graceful_stop = "2s"
threshold_interval = "50ms"

[thresholds]
http_req_failed = "rate < 0.1"
"checks{check:products loaded}" = "rate == 1"

[[stages]]
duration = "400ms"
target = 2

[[steps]]
kind = "request"
name = "login"
method = "POST"
url = "/login"
json = { user = "demo" }
expect_status = [200, 201]
extract = [{ var = "token", token = true }]

[[steps]]
kind = "request"
name = "products"
url = "/products"
headers = { Authorization = "Bearer ${token}" }
checks = [{ name = "products loaded", status = 200 }]
extract = [{ var = "product_id", pointer = "/0/id", required = false }]

[[steps]]
kind = "request"
name = "cart"
method = "POST"
url = "/cart"
json = { productId = "${product_id}", quantity = 1 }
checks = [{ name = "added to cart", status = [200, 201] }]

[[steps]]
kind = "pause"
duration = "50ms"
"#;

fn cli_for(addr: SocketAddr) -> CliArgs {
    CliArgs {
        base_url: Some(format!("http://{addr}")),
        ..CliArgs::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_token_is_sent_as_bearer_on_later_steps() {
    let seen = Seen::default();
    let addr = spawn_api(seen.clone()).await;
    let config = LoadTestConfig::from_toml_str(SHOP_FLOW, &cli_for(addr), &EnvSnapshot::default())
        .expect("valid shop flow");

    let test = LoadTest::new(config).expect("engine");
    let report = test.run(CancellationToken::new()).await.expect("run");

    assert!(report.passed, "thresholds failed: {report}");
    assert!(report.total_iterations >= 1);
    assert_eq!(report.aborted_iterations, 0);
    assert!(!report.interrupted);

    let auth = seen.auth.lock();
    assert!(!auth.is_empty());
    assert!(auth.iter().all(|value| value == "Bearer abc"));

    let carts = seen.carts.lock();
    assert!(!carts.is_empty());
    assert!(carts
        .iter()
        .all(|body| *body == json!({ "productId": 7, "quantity": 1 })));

    let tally = &report.checks["products loaded"];
    assert_eq!(tally.fails, 0);
    assert!(tally.passes >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_base_url_fails_before_any_traffic() {
    let seen = Seen::default();
    let _addr = spawn_api(seen.clone()).await;

    let err = LoadTestConfig::from_toml_str(SHOP_FLOW, &CliArgs::default(), &EnvSnapshot::default())
        .expect_err("no base url configured");
    assert!(matches!(err, ConfigError::MissingBaseUrl { .. }));
    assert_eq!(seen.hits.load(Ordering::Relaxed), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_target_aborts_iterations_and_fails_thresholds() {
    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("reserve port");
        listener.local_addr().expect("reserved addr")
    };
    let text = SHOP_FLOW.replace("duration = \"400ms\"", "duration = \"150ms\"");
    let config = LoadTestConfig::from_toml_str(&text, &cli_for(closed), &EnvSnapshot::default())
        .expect("valid shop flow");

    let test = LoadTest::new(config).expect("engine");
    let recorder = test.recorder();
    let report = test.run(CancellationToken::new()).await.expect("run");

    assert!(!report.passed);
    assert_eq!(report.total_iterations, 0);
    assert!(report.aborted_iterations >= 1);
    assert_eq!(
        recorder.count(ITERATIONS_ABORTED, &Default::default()) as u64,
        report.aborted_iterations
    );
    // Only the login step is ever attempted.
    assert_eq!(
        recorder.tag_values(HTTP_REQS, "name"),
        vec!["login".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_still_produces_a_report() {
    let seen = Seen::default();
    let addr = spawn_api(seen.clone()).await;
    let text = SHOP_FLOW
        .replace("duration = \"400ms\"", "duration = \"30s\"")
        .replace("name = \"shop\"", "name = \"shop\"\nstart_vus = 2");
    let config = LoadTestConfig::from_toml_str(&text, &cli_for(addr), &EnvSnapshot::default())
        .expect("valid shop flow");

    let test = LoadTest::new(config).expect("engine");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(10), test.run(cancel))
        .await
        .expect("run stops after cancellation")
        .expect("run");
    assert!(report.interrupted);
    assert!(report.duration_ms < 10_000);
    assert!(seen.hits.load(Ordering::Relaxed) > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_timeout_stops_a_long_plan() {
    let seen = Seen::default();
    let addr = spawn_api(seen.clone()).await;
    let text = SHOP_FLOW
        .replace("duration = \"400ms\"", "duration = \"30s\"")
        .replace("name = \"shop\"", "name = \"shop\"\nstart_vus = 2");
    let cli = CliArgs {
        run_timeout: Some(Duration::from_millis(300)),
        ..cli_for(addr)
    };
    let config = LoadTestConfig::from_toml_str(&text, &cli, &EnvSnapshot::default())
        .expect("valid shop flow");
    assert_eq!(config.run_timeout, Some(Duration::from_millis(300)));

    let test = LoadTest::new(config).expect("engine");
    let report = tokio::time::timeout(Duration::from_secs(10), test.run(CancellationToken::new()))
        .await
        .expect("run stops at the run timeout")
        .expect("run");
    assert!(report.interrupted);
    assert!(report.duration_ms < 10_000, "ran for {}ms", report.duration_ms);
    assert!(seen.hits.load(Ordering::Relaxed) > 0);
}

const FAILING_FLOW: &str = r#"
name = "failing"
start_vus = 2
ramp_tick = "20ms"
graceful_stop = "2s"
threshold_interval = "50ms"

[thresholds]
http_req_failed = [{ condition = "rate < 0.1", abort_on_fail = true }]

[[stages]]
duration = "30s"
target = 2

[[steps]]
kind = "request"
name = "broken"
url = "/broken"

[[steps]]
kind = "pause"
duration = "20ms"
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_on_fail_breach_ends_the_run_early() {
    let seen = Seen::default();
    let addr = spawn_api(seen.clone()).await;
    let config = LoadTestConfig::from_toml_str(FAILING_FLOW, &cli_for(addr), &EnvSnapshot::default())
        .expect("valid failing flow");

    let test = LoadTest::new(config).expect("engine");
    let report = tokio::time::timeout(Duration::from_secs(10), test.run(CancellationToken::new()))
        .await
        .expect("breach stops the run")
        .expect("run");
    assert!(report.interrupted);
    assert!(!report.passed);
    assert!(report.duration_ms < 10_000, "ran for {}ms", report.duration_ms);
    let breaches: Vec<_> = report.failed_thresholds().map(|t| t.metric.as_str()).collect();
    assert_eq!(breaches, vec!["http_req_failed"]);
    assert!(seen.hits.load(Ordering::Relaxed) > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unwritable_report_path_still_returns_the_report() {
    let seen = Seen::default();
    let addr = spawn_api(seen.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").expect("write blocker file");
    let path = blocker.join("report.json");

    let text = SHOP_FLOW.replace("duration = \"400ms\"", "duration = \"150ms\"");
    let cli = CliArgs {
        report_json: Some(path.clone()),
        ..cli_for(addr)
    };
    let config = LoadTestConfig::from_toml_str(&text, &cli, &EnvSnapshot::default())
        .expect("valid shop flow");

    let test = LoadTest::new(config).expect("engine");
    let report = test
        .run(CancellationToken::new())
        .await
        .expect("report survives a failed write");
    assert_eq!(report.name, "shop");
    assert!(!path.exists());
    assert!(report.to_string().contains("shop"));
}
