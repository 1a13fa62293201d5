use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracepulse_core::error::{Result, TracepulseError};
use tracepulse_core::model::request::RequestEventPayload;
use tracepulse_core::model::span::SpanPayload;
use tracing::Level;

use crate::api::{ApiResult, require_tenant};
use crate::otlp;
use crate::queue::PushReceipt;
use crate::registry::TenantRegistry;

#[derive(Clone)]
pub struct IngestState {
    pub registry: Arc<TenantRegistry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TenantParam {
    pub tenant: Option<String>,
}

/// Receipt for accepted events. Overflow still counts as accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestReceipt {
    pub status: String,
    pub accepted: usize,
    pub dropped_oldest: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Many(items) => items,
            Self::One(item) => vec![item],
        }
    }
}

pub fn router(registry: Arc<TenantRegistry>) -> Router {
    let state = IngestState { registry };
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    Router::new()
        .route("/ingest/span", post(ingest_spans))
        .route("/ingest/request", post(ingest_requests))
        .route("/v1/traces", post(otlp::http::export_traces))
        .route("/healthz", get(|| async { "ok" }))
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .on_request(tower_http::trace::DefaultOnRequest::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

fn parse_items<T: DeserializeOwned>(body: &[u8]) -> Result<Vec<T>> {
    let items = serde_json::from_slice::<OneOrMany<T>>(body)
        .map_err(|e| TracepulseError::Parse(format!("invalid JSON body: {e}")))?
        .into_vec();
    if items.is_empty() {
        return Err(TracepulseError::InvalidArgument("empty batch".to_string()));
    }
    Ok(items)
}

fn accepted(receipts: &[PushReceipt]) -> (StatusCode, Json<IngestReceipt>) {
    (
        StatusCode::ACCEPTED,
        Json(IngestReceipt {
            status: "accepted".to_string(),
            accepted: receipts.len(),
            dropped_oldest: receipts.iter().any(|r| r.dropped_oldest),
        }),
    )
}

/// The whole batch is validated before any of it is enqueued.
async fn ingest_spans(
    State(state): State<IngestState>,
    Query(param): Query<TenantParam>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<IngestReceipt>)> {
    let tenant = require_tenant(&headers, param.tenant.as_deref())?;
    let spans = parse_items::<SpanPayload>(&body)?
        .into_iter()
        .map(SpanPayload::into_span)
        .collect::<Result<Vec<_>>>()?;

    let pipeline = state.registry.pipeline_for_ingest(&tenant)?;
    let receipts = spans
        .into_iter()
        .map(|span| pipeline.ingest_span(span))
        .collect::<Result<Vec<_>>>()?;
    tracing::debug!(tenant = %tenant, count = receipts.len(), "spans accepted");
    Ok(accepted(&receipts))
}

async fn ingest_requests(
    State(state): State<IngestState>,
    Query(param): Query<TenantParam>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<IngestReceipt>)> {
    let tenant = require_tenant(&headers, param.tenant.as_deref())?;
    let received_at = Utc::now();
    let events = parse_items::<RequestEventPayload>(&body)?
        .into_iter()
        .map(|payload| payload.into_event(received_at))
        .collect::<Result<Vec<_>>>()?;

    let pipeline = state.registry.pipeline_for_ingest(&tenant)?;
    let receipts = events
        .into_iter()
        .map(|event| pipeline.ingest_request(event))
        .collect::<Result<Vec<_>>>()?;
    tracing::debug!(tenant = %tenant, count = receipts.len(), "request events accepted");
    Ok(accepted(&receipts))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use axum::body::Body;
    use axum::http::{Request, header};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tower::ServiceExt;
    use tracepulse_core::config::Config;
    use tracepulse_core::ids::TenantId;
    use tracepulse_testkit::{otlp_trace_body, span_json};

    use super::*;
    use crate::api::ErrorEnvelope;

    fn registry(cfg: Config) -> Arc<TenantRegistry> {
        Arc::new(TenantRegistry::new(Arc::new(cfg)))
    }

    fn post_json(uri: &str, tenant: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
        if let Some(tenant) = tenant {
            builder = builder.header("x-tenant-id", tenant);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn read_json<T: DeserializeOwned>(res: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn wait_for_spans(registry: &TenantRegistry, tenant: &str, spans: usize) {
        let tenant = TenantId::parse(tenant).unwrap();
        for _ in 0..200 {
            if let Ok(pipeline) = registry.get(&tenant)
                && pipeline.store().trace_counts().spans == spans
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("spans never arrived for {tenant}");
    }

    #[tokio::test]
    async fn span_batch_is_accepted() {
        let registry = registry(Config::default());
        let app = router(registry.clone());
        let body = serde_json::json!([
            span_json("T", "A", None, "svc1"),
            span_json("T", "B", Some("A"), "svc2"),
        ]);
        let res = app
            .oneshot(post_json("/ingest/span", Some("acme"), body))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        let receipt: IngestReceipt = read_json(res).await;
        assert_eq!(receipt.accepted, 2);
        assert!(!receipt.dropped_oldest);
        wait_for_spans(&registry, "acme", 2).await;
    }

    #[tokio::test]
    async fn invalid_span_is_rejected_with_kind() {
        let app = router(registry(Config::default()));
        let mut bad = span_json("T", "A", None, "svc1");
        bad["duration"] = serde_json::json!(-5.0);
        let res = app
            .oneshot(post_json("/ingest/span", Some("acme"), bad))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: ErrorEnvelope = read_json(res).await;
        assert_eq!(body.error.kind, "InvalidSpan");
    }

    #[tokio::test]
    async fn missing_tenant_and_missing_trace_id_are_client_errors() {
        let app = router(registry(Config::default()));
        let res = app
            .clone()
            .oneshot(post_json("/ingest/span", None, span_json("T", "A", None, "svc")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: ErrorEnvelope = read_json(res).await;
        assert_eq!(body.error.kind, "MissingIdentifier");

        let mut no_trace = span_json("T", "A", None, "svc");
        no_trace["traceId"] = serde_json::Value::Null;
        let res = app
            .oneshot(post_json("/ingest/span?tenant=acme", None, no_trace))
            .await
            .unwrap();
        let body: ErrorEnvelope = read_json(res).await;
        assert_eq!(body.error.kind, "MissingIdentifier");
    }

    #[tokio::test]
    async fn request_events_validate_status_codes() {
        let app = router(registry(Config::default()));
        let ok = serde_json::json!({
            "method": "get", "path": "/users/42", "statusCode": 200, "responseTime": 12.5
        });
        let res = app
            .clone()
            .oneshot(post_json("/ingest/request", Some("acme"), ok))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let bad = serde_json::json!({
            "method": "GET", "path": "/users", "statusCode": 999, "responseTime": 1.0
        });
        let res = app
            .oneshot(post_json("/ingest/request", Some("acme"), bad))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: ErrorEnvelope = read_json(res).await;
        assert_eq!(body.error.kind, "InvalidRequestEvent");
    }

    #[tokio::test]
    async fn overflow_is_soft() {
        let app = router(registry(Config {
            queue_capacity: 1,
            ..Config::default()
        }));
        let events = (0..50)
            .map(|i| {
                serde_json::json!({
                    "method": "GET", "path": format!("/p/{i}"), "statusCode": 200,
                    "responseTime": 1.0
                })
            })
            .collect::<Vec<_>>();
        let res = app
            .oneshot(post_json("/ingest/request", Some("acme"), serde_json::json!(events)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        let receipt: IngestReceipt = read_json(res).await;
        assert_eq!(receipt.accepted, 50);
    }

    #[tokio::test]
    async fn deactivated_tenant_gets_conflict() {
        let registry = registry(Config::default());
        registry.deactivate(&TenantId::parse("acme").unwrap());
        let res = router(registry)
            .oneshot(post_json("/ingest/span", Some("acme"), span_json("T", "A", None, "svc")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
        let body: ErrorEnvelope = read_json(res).await;
        assert_eq!(body.error.kind, "TenantInactive");
    }

    #[tokio::test]
    async fn otlp_gzip_body_is_accepted() {
        let registry = registry(Config::default());
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&otlp_trace_body("checkout", Some("acme")))
            .unwrap();
        let body = encoder.finish().unwrap();

        let req = Request::post("/v1/traces")
            .header(header::CONTENT_TYPE, "application/x-protobuf")
            .header(header::CONTENT_ENCODING, "gzip")
            .body(Body::from(body))
            .unwrap();
        let res = router(registry.clone()).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        wait_for_spans(&registry, "acme", 2).await;
    }

    #[tokio::test]
    async fn garbage_otlp_body_is_a_parse_error() {
        let req = Request::post("/v1/traces")
            .header("x-tenant-id", "acme")
            .body(Body::from(vec![0xff, 0xff, 0xff]))
            .unwrap();
        let res = router(registry(Config::default())).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: ErrorEnvelope = read_json(res).await;
        assert_eq!(body.error.kind, "Parse");
    }
}
