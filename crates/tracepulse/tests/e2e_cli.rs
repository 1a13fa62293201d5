use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use futures::StreamExt;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use serial_test::serial;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracepulse_testkit::{otlp_trace_request, span_json};

const TENANT: &str = "acme";
const CONFIG: &str = r#"
tick_interval = "100ms"
trace_idle_timeout = "300ms"
service_map_interval = "200ms"
heartbeat_interval = "1s"
idle_timeout = "30s"
tenants = ["acme"]

[[alert_rules]]
name = "checkout-errors"
metric = "error_rate"
comparator = ">"
threshold = 0.1
severity = "high"
cooldown_seconds = 60
"#;

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_tracepulse")
}

struct Server {
    child: Child,
    grpc_port: u16,
    http_port: u16,
    query_port: u16,
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn write_config(temp: &Path) -> PathBuf {
    let path = temp.join("config.toml");
    std::fs::write(&path, CONFIG).unwrap();
    path
}

fn spawn_server(temp: &Path) -> Server {
    let grpc_port = free_port();
    let http_port = free_port();
    let query_port = free_port();

    let child = Command::new(bin())
        .arg("run")
        .arg("--ingest-grpc-addr")
        .arg(format!("127.0.0.1:{grpc_port}"))
        .arg("--ingest-http-addr")
        .arg(format!("127.0.0.1:{http_port}"))
        .arg("--query-http-addr")
        .arg(format!("127.0.0.1:{query_port}"))
        .env("TRACEPULSE_CONFIG", write_config(temp))
        .env_remove("OTEL_EXPORTER_OTLP_ENDPOINT")
        .env_remove("TRACEPULSE_SELF_OBSERVE")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    Server {
        child,
        grpc_port,
        http_port,
        query_port,
    }
}

async fn wait_ready(server: &mut Server) {
    let client = reqwest::Client::new();
    for _ in 0..100 {
        assert!(
            server.child.try_wait().unwrap().is_none(),
            "tracepulse exited early"
        );
        let ingest = client
            .get(format!("http://127.0.0.1:{}/healthz", server.http_port))
            .send()
            .await;
        let query = client
            .get(format!("http://127.0.0.1:{}/healthz", server.query_port))
            .send()
            .await;
        if ingest.is_ok() && query.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("servers not ready");
}

/// Polls a query endpoint until `done` accepts the JSON body.
async fn poll_json(
    port: u16,
    path: &str,
    done: impl Fn(&serde_json::Value) -> bool,
) -> serde_json::Value {
    let client = reqwest::Client::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let resp = client
            .get(format!("http://127.0.0.1:{port}{path}"))
            .header("x-tenant-id", TENANT)
            .send()
            .await
            .unwrap();
        if resp.status().is_success() {
            let body: serde_json::Value = resp.json().await.unwrap();
            if done(&body) {
                return body;
            }
        }
        assert!(Instant::now() < deadline, "timed out polling {path}");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn request_events(count: usize, errors: usize) -> serde_json::Value {
    let events = (0..count)
        .map(|i| {
            serde_json::json!({
                "method": "GET",
                "path": format!("/checkout/{i}"),
                "statusCode": if i < errors { 500 } else { 200 },
                "responseTime": 10.0 + i as f64,
                "bytesTransferred": 512,
            })
        })
        .collect::<Vec<_>>();
    serde_json::Value::Array(events)
}

async fn post(port: u16, path: &str, body: serde_json::Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}{path}"))
        .header("x-tenant-id", TENANT)
        .json(&body)
        .send()
        .await
        .unwrap()
}

fn cli(server: &Server, args: &[&str]) -> std::process::Output {
    Command::new(bin())
        .args(args)
        .arg("--addr")
        .arg(format!("127.0.0.1:{}", server.query_port))
        .arg("--tenant")
        .arg(TENANT)
        .output()
        .unwrap()
}

#[tokio::test]
#[serial]
async fn e2e_json_ingest_and_cli_queries() {
    let temp = tempfile::tempdir().unwrap();
    let mut server = spawn_server(temp.path());
    wait_ready(&mut server).await;

    let spans = serde_json::json!([
        span_json("e2e-trace", "root", None, "gateway"),
        span_json("e2e-trace", "child", Some("root"), "orders"),
    ]);
    let resp = post(server.http_port, "/ingest/span", spans).await;
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

    let resp = post(server.http_port, "/ingest/request", request_events(20, 0)).await;
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

    poll_json(server.query_port, "/traces/e2e-trace", |v| {
        v["summary"]["span_count"] == 2
    })
    .await;
    poll_json(server.query_port, "/stats", |v| v["total_requests"] == 20).await;

    let output = cli(&server, &["--json", "trace", "e2e-trace"]);
    assert!(output.status.success());
    let trace: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(trace["summary"]["services"], serde_json::json!(["gateway", "orders"]));
    assert_eq!(trace["hierarchy"]["entries"][1]["depth"], 1);

    let output = cli(&server, &["stats"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("requests=20"), "unexpected stats output: {stdout}");

    let export_path = temp.path().join("trace.json");
    let output = cli(
        &server,
        &["export", "e2e-trace", "-o", export_path.to_str().unwrap()],
    );
    assert!(output.status.success());
    let exported: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&export_path).unwrap()).unwrap();
    assert_eq!(exported["trace_id"], "e2e-trace");
    assert_eq!(exported["span_count"], 2);

    let output = cli(&server, &["trace", "missing-trace"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("TraceNotFound"));
}

#[tokio::test]
#[serial]
async fn e2e_otlp_grpc_ingest_uses_tenant_metadata() {
    let temp = tempfile::tempdir().unwrap();
    let mut server = spawn_server(temp.path());
    wait_ready(&mut server).await;

    let mut client = TraceServiceClient::connect(format!("http://127.0.0.1:{}", server.grpc_port))
        .await
        .unwrap();
    let mut request = tonic::Request::new(otlp_trace_request("checkout", None));
    request
        .metadata_mut()
        .insert("x-tenant-id", TENANT.parse().unwrap());
    let response = client.export(request).await.unwrap().into_inner();
    assert!(response.partial_success.is_none());

    let trace_id = "ab".repeat(16);
    let trace = poll_json(server.query_port, &format!("/traces/{trace_id}"), |v| {
        v["summary"]["span_count"] == 2
    })
    .await;
    assert_eq!(trace["summary"]["error_count"], 1);

    let map = poll_json(server.query_port, "/service-map", |v| {
        v["trace_count"].as_u64().unwrap_or(0) >= 1
    })
    .await;
    assert_eq!(map["services"][0]["name"], "checkout");
}

#[tokio::test]
#[serial]
async fn e2e_error_rate_alert_reaches_stream_subscribers() {
    let temp = tempfile::tempdir().unwrap();
    let mut server = spawn_server(temp.path());
    wait_ready(&mut server).await;

    let url = format!(
        "ws://127.0.0.1:{}/stream?tenant={TENANT}&topics=alerts",
        server.query_port
    );
    let (ws, _) = connect_async(url.as_str()).await.unwrap();
    let (_write, mut read) = ws.split();

    let first = tokio::time::timeout(Duration::from_secs(5), read.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text) = first else {
        panic!("expected a text frame, got {first:?}");
    };
    let initial: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(initial["type"], "initial");

    let resp = post(server.http_port, "/ingest/request", request_events(20, 10)).await;
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

    let deadline = Instant::now() + Duration::from_secs(10);
    let alert = loop {
        assert!(Instant::now() < deadline, "no alert frame arrived");
        let msg = tokio::time::timeout(Duration::from_secs(5), read.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            let frame: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            assert!(frame["seq"].as_u64().unwrap() > initial["seq"].as_u64().unwrap());
            if frame["type"] == "alert" {
                break frame;
            }
        }
    };
    assert_eq!(alert["data"]["rule"], "checkout-errors");
    assert_eq!(alert["data"]["severity"], "high");

    let alerts = poll_json(server.query_port, "/alerts", |v| {
        v.as_array().is_some_and(|a| !a.is_empty())
    })
    .await;
    assert_eq!(alerts[0]["rule"], "checkout-errors");
}

#[tokio::test]
#[serial]
async fn e2e_deactivated_tenant_rejects_ingest() {
    let temp = tempfile::tempdir().unwrap();
    let mut server = spawn_server(temp.path());
    wait_ready(&mut server).await;

    let resp = reqwest::Client::new()
        .delete(format!("http://127.0.0.1:{}/tenants/{TENANT}", server.query_port))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let resp = post(
        server.http_port,
        "/ingest/span",
        span_json("late", "a", None, "gateway"),
    )
    .await;
    assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "TenantInactive");

    let output = cli(&server, &["--json", "status"]);
    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["deactivated"], serde_json::json!([TENANT]));
}
