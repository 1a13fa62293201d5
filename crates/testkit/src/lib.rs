use chrono::{DateTime, Duration, TimeZone, Utc};
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span as OtlpSpan, Status};
use prost::Message;
use tracepulse_core::ids::{SpanId, TraceId};
use tracepulse_core::model::request::RequestEvent;
use tracepulse_core::model::span::{Span, SpanStatus, SpanType};

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
}

pub fn span(
    trace_id: &str,
    span_id: &str,
    parent: Option<&str>,
    service: &str,
    start: DateTime<Utc>,
    duration_ms: f64,
) -> Span {
    Span {
        trace_id: TraceId::parse(trace_id).unwrap(),
        span_id: SpanId::parse(span_id).unwrap(),
        parent_span_id: parent.map(|p| SpanId::parse(p).unwrap()),
        service_name: service.to_string(),
        operation_name: format!("{service}.handle"),
        span_type: SpanType::Service,
        start_time: start,
        duration_ms,
        status: SpanStatus::Ok,
        tags: Default::default(),
    }
}

/// gateway -> orders -> postgres, with the database call failing.
pub fn sample_trace(trace_id: &str) -> Vec<Span> {
    let base = base_time();
    let mut root = span(trace_id, "root", None, "gateway", base, 180.0);
    root.operation_name = "GET /v1/orders".to_string();
    root.span_type = SpanType::Http;
    root.tags.insert("http.method".into(), "GET".into());

    let mut orders = span(
        trace_id,
        "orders",
        Some("root"),
        "orders",
        base + Duration::milliseconds(20),
        120.0,
    );
    orders.operation_name = "list_orders".to_string();

    let mut db = span(
        trace_id,
        "db",
        Some("orders"),
        "postgres",
        base + Duration::milliseconds(40),
        70.0,
    );
    db.operation_name = "SELECT orders".to_string();
    db.span_type = SpanType::Database;
    db.status = SpanStatus::Error;
    db.tags.insert("db.system".into(), "postgresql".into());

    vec![root, orders, db]
}

pub fn request(ts: DateTime<Utc>, path: &str, status_code: u16, response_time_ms: f64) -> RequestEvent {
    RequestEvent {
        timestamp: ts,
        method: "GET".to_string(),
        path: path.to_string(),
        status_code,
        response_time_ms,
        bytes_transferred: 512,
    }
}

/// `count` events spread evenly over `span`, the first `errors` of every
/// `count / errors` answered with a 500.
pub fn uniform_requests(
    start: DateTime<Utc>,
    span: Duration,
    count: usize,
    errors: usize,
) -> Vec<RequestEvent> {
    let step_ms = span.num_milliseconds() / count.max(1) as i64;
    let every = if errors == 0 { usize::MAX } else { count / errors };
    (0..count)
        .map(|i| {
            let status = if errors > 0 && i % every == 0 && i / every < errors {
                500
            } else {
                200
            };
            request(
                start + Duration::milliseconds(step_ms * i as i64),
                "/v1/orders",
                status,
                40.0,
            )
        })
        .collect()
}

fn kv(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value.to_string())),
        }),
    }
}

/// Two-span OTLP export for `service`, optionally tagged with `tenant.id`.
pub fn otlp_trace_request(service: &str, tenant: Option<&str>) -> ExportTraceServiceRequest {
    let start = base_time().timestamp_nanos_opt().unwrap_or_default() as u64;
    let mut attributes = vec![kv("service.name", service)];
    if let Some(tenant) = tenant {
        attributes.push(kv("tenant.id", tenant));
    }

    let trace_id = vec![0xab; 16];
    let spans = vec![
        OtlpSpan {
            trace_id: trace_id.clone(),
            span_id: vec![1; 8],
            name: "GET /checkout".to_string(),
            kind: 2,
            start_time_unix_nano: start,
            end_time_unix_nano: start + 100_000_000,
            attributes: vec![kv("http.method", "GET")],
            ..Default::default()
        },
        OtlpSpan {
            trace_id,
            span_id: vec![2; 8],
            parent_span_id: vec![1; 8],
            name: "SELECT carts".to_string(),
            kind: 3,
            start_time_unix_nano: start + 10_000_000,
            end_time_unix_nano: start + 50_000_000,
            attributes: vec![kv("db.system", "postgresql")],
            status: Some(Status {
                code: 2,
                message: "timeout".to_string(),
            }),
            ..Default::default()
        },
    ];

    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Some(Resource {
                attributes,
                ..Default::default()
            }),
            scope_spans: vec![ScopeSpans {
                spans,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

pub fn otlp_trace_body(service: &str, tenant: Option<&str>) -> Vec<u8> {
    otlp_trace_request(service, tenant).encode_to_vec()
}

pub fn span_json(trace_id: &str, span_id: &str, parent: Option<&str>, service: &str) -> serde_json::Value {
    serde_json::json!({
        "traceId": trace_id,
        "spanId": span_id,
        "parentSpanId": parent,
        "serviceName": service,
        "operationName": format!("{service}.handle"),
        "startTime": base_time().to_rfc3339(),
        "duration": 25.0,
        "status": "ok",
    })
}
