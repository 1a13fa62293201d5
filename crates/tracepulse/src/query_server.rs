use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracepulse_core::config::Config;
use tracepulse_core::ids::{TenantId, TraceId};
use tracepulse_core::model::alert::{Alert, AlertRule, RuleStatus};
use tracepulse_core::model::service::ServiceMap;
use tracepulse_core::model::stats::{EndpointStat, MetricKind, Stats, TimeSeries};
use tracepulse_core::query::{StatusResponse, TenantStatus, TraceResponse, TraceSummary, TracesQuery};
use tracepulse_core::stream::StreamContract;
use tracepulse_ingest::TenantPipeline;
use tracepulse_ingest::TenantRegistry;
use tracepulse_ingest::api::{ApiResult, require_tenant};
use tracing::Level;

use crate::stream;

#[derive(Clone)]
pub struct QueryState {
    pub registry: Arc<TenantRegistry>,
    pub cfg: Arc<Config>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TenantParam {
    pub tenant: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LimitParam {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct SeriesParam {
    metric: Option<String>,
}

impl QueryState {
    pub fn pipeline(
        &self,
        headers: &HeaderMap,
        param: &TenantParam,
    ) -> ApiResult<Arc<TenantPipeline>> {
        let tenant = require_tenant(headers, param.tenant.as_deref())?;
        Ok(self.registry.get(&tenant)?)
    }
}

pub fn router(registry: Arc<TenantRegistry>, cfg: Arc<Config>) -> Router {
    let state = QueryState { registry, cfg };
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::PUT, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);
    Router::new()
        .route("/traces", get(list_traces))
        .route("/traces/{trace_id}", get(get_trace))
        .route("/traces/{trace_id}/export", get(export_trace))
        .route("/service-map", get(service_map))
        .route("/stats", get(stats))
        .route("/alerts", get(alerts))
        .route("/endpoints", get(endpoints))
        .route("/time-series", get(time_series))
        .route("/alert-rules", get(alert_rules).put(replace_alert_rules))
        .route(
            "/tenants/{tenant}",
            axum::routing::post(activate_tenant).delete(deactivate_tenant),
        )
        .route("/status", get(status))
        .route("/stream", get(stream::stream_handler))
        .route("/stream/contract", get(stream_contract))
        .route("/healthz", get(|| async { "ok" }))
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .on_request(tower_http::trace::DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .with_state(state)
}

pub async fn run_query_http_server(
    registry: Arc<TenantRegistry>,
    cfg: Arc<Config>,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind query http listener {addr}"))?;
    tracing::info!(addr = %addr, "query http listening");
    axum::serve(listener, router(registry, cfg))
        .await
        .context("query http server failed")
}

async fn list_traces(
    State(state): State<QueryState>,
    Query(param): Query<TenantParam>,
    Query(query): Query<TracesQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<TraceSummary>>> {
    let pipeline = state.pipeline(&headers, &param)?;
    let filter = query.into_filter()?;
    Ok(Json(pipeline.store().list_traces(&filter)))
}

async fn get_trace(
    State(state): State<QueryState>,
    Path(trace_id): Path<String>,
    Query(param): Query<TenantParam>,
    headers: HeaderMap,
) -> ApiResult<Json<TraceResponse>> {
    let pipeline = state.pipeline(&headers, &param)?;
    let trace_id = TraceId::parse(&trace_id)?;
    Ok(Json(pipeline.store().get_trace(&trace_id)?))
}

async fn export_trace(
    State(state): State<QueryState>,
    Path(trace_id): Path<String>,
    Query(param): Query<TenantParam>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let pipeline = state.pipeline(&headers, &param)?;
    let trace_id = TraceId::parse(&trace_id)?;
    let export = pipeline.store().export_trace(&trace_id)?;
    let body = export.to_json_bytes()?;
    let disposition = format!("attachment; filename=\"{}\"", export.filename(Utc::now()));
    let disposition = HeaderValue::from_str(&disposition).map_err(|e| {
        tracepulse_core::TracepulseError::Internal(format!("bad export filename: {e}"))
    })?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/json")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

async fn service_map(
    State(state): State<QueryState>,
    Query(param): Query<TenantParam>,
    headers: HeaderMap,
) -> ApiResult<Json<ServiceMap>> {
    let pipeline = state.pipeline(&headers, &param)?;
    Ok(Json(pipeline.store().service_map().as_ref().clone()))
}

async fn stats(
    State(state): State<QueryState>,
    Query(param): Query<TenantParam>,
    headers: HeaderMap,
) -> ApiResult<Json<Stats>> {
    let pipeline = state.pipeline(&headers, &param)?;
    Ok(Json(pipeline.stats(Utc::now())))
}

async fn alerts(
    State(state): State<QueryState>,
    Query(param): Query<TenantParam>,
    Query(limit): Query<LimitParam>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Alert>>> {
    let pipeline = state.pipeline(&headers, &param)?;
    let limit = limit.limit.unwrap_or(state.cfg.alert_history);
    Ok(Json(pipeline.store().alert_history(limit)))
}

async fn endpoints(
    State(state): State<QueryState>,
    Query(param): Query<TenantParam>,
    Query(limit): Query<LimitParam>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<EndpointStat>>> {
    let pipeline = state.pipeline(&headers, &param)?;
    let limit = limit.limit.unwrap_or(state.cfg.top_endpoints);
    Ok(Json(pipeline.store().top_endpoints(limit)))
}

async fn time_series(
    State(state): State<QueryState>,
    Query(param): Query<TenantParam>,
    Query(series): Query<SeriesParam>,
    headers: HeaderMap,
) -> ApiResult<Json<TimeSeries>> {
    let pipeline = state.pipeline(&headers, &param)?;
    let metric = series
        .metric
        .as_deref()
        .map(str::parse::<MetricKind>)
        .transpose()?
        .unwrap_or(MetricKind::Rps);
    Ok(Json(
        pipeline
            .store()
            .time_series(metric, pipeline.dropped_events()),
    ))
}

async fn alert_rules(
    State(state): State<QueryState>,
    Query(param): Query<TenantParam>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<RuleStatus>>> {
    let pipeline = state.pipeline(&headers, &param)?;
    Ok(Json(pipeline.store().alert_rules()))
}

/// Replaces the tenant's rule set. Rules that do not resolve are kept with
/// `last_error` set so they can be corrected by a later PUT.
async fn replace_alert_rules(
    State(state): State<QueryState>,
    Query(param): Query<TenantParam>,
    headers: HeaderMap,
    Json(rules): Json<Vec<AlertRule>>,
) -> ApiResult<Json<Vec<RuleStatus>>> {
    let pipeline = state.pipeline(&headers, &param)?;
    pipeline.store().replace_alert_rules(rules);
    Ok(Json(pipeline.store().alert_rules()))
}

async fn activate_tenant(
    State(state): State<QueryState>,
    Path(tenant): Path<String>,
) -> ApiResult<Json<TenantStatus>> {
    let tenant = TenantId::parse(&tenant)?;
    Ok(Json(state.registry.activate(&tenant).status()))
}

async fn deactivate_tenant(
    State(state): State<QueryState>,
    Path(tenant): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let tenant = TenantId::parse(&tenant)?;
    let was_active = state.registry.deactivate(&tenant);
    Ok(Json(serde_json::json!({
        "tenant": tenant,
        "deactivated": true,
        "was_active": was_active,
    })))
}

async fn status(State(state): State<QueryState>) -> Json<StatusResponse> {
    Json(state.registry.status())
}

async fn stream_contract(State(state): State<QueryState>) -> Json<StreamContract> {
    Json(StreamContract::from_config(&state.cfg))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;
    use tracepulse_core::query::TraceExport;
    use tracepulse_ingest::api::ErrorEnvelope;
    use tracepulse_testkit::{base_time, request as request_event, sample_trace, span};

    use super::*;

    fn setup() -> (Arc<TenantRegistry>, Router) {
        let cfg = Arc::new(Config::default());
        let registry = Arc::new(TenantRegistry::new(cfg.clone()));
        let app = router(registry.clone(), cfg);
        (registry, app)
    }

    fn seeded_pipeline(registry: &TenantRegistry) -> Arc<TenantPipeline> {
        let pipeline = registry.activate(&TenantId::parse("acme").unwrap());
        let t0 = base_time();
        pipeline.store().ingest_span(span("T", "A", None, "svc1", t0, 100.0), t0);
        pipeline
            .store()
            .ingest_span(span("T", "B", Some("A"), "svc2", t0, 40.0), t0);
        pipeline.store().ingest_spans(sample_trace("slow"), t0);
        pipeline
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri)
            .header("x-tenant-id", "acme")
            .body(Body::empty())
            .unwrap()
    }

    async fn read_json<T: DeserializeOwned>(res: Response) -> T {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn trace_endpoint_returns_hierarchy() {
        let (registry, app) = setup();
        seeded_pipeline(&registry);

        let res = app.oneshot(get("/traces/T")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let trace: TraceResponse = read_json(res).await;
        assert_eq!(trace.summary.total_duration_ms, 100.0);
        assert_eq!(trace.summary.services, vec!["svc1", "svc2"]);
        assert_eq!(trace.hierarchy.entries[1].depth, 1);
    }

    #[tokio::test]
    async fn unknown_trace_is_404_and_unknown_tenant_is_409() {
        let (registry, app) = setup();
        seeded_pipeline(&registry);

        let res = app.clone().oneshot(get("/traces/nope")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body: ErrorEnvelope = read_json(res).await;
        assert_eq!(body.error.kind, "TraceNotFound");

        let res = app
            .oneshot(
                Request::get("/stats?tenant=ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn list_traces_applies_query_filters() {
        let (registry, app) = setup();
        seeded_pipeline(&registry);

        let res = app
            .oneshot(get("/traces?error_only=true&sort=duration_desc&limit=5"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let traces: Vec<TraceSummary> = read_json(res).await;
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].trace_id.as_str(), "slow");
    }

    #[tokio::test]
    async fn bad_sort_is_a_client_error() {
        let (registry, app) = setup();
        seeded_pipeline(&registry);
        let res = app.oneshot(get("/traces?sort=sideways")).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn export_sets_download_headers_and_round_trips() {
        let (registry, app) = setup();
        seeded_pipeline(&registry);

        let res = app.oneshot(get("/traces/slow/export")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let disposition = res
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment; filename=\"trace-slow-"));
        assert!(disposition.ends_with(".json\""));

        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let export = TraceExport::parse(&bytes).unwrap();
        assert_eq!(export.span_count, 3);
    }

    #[tokio::test]
    async fn export_filename_stays_quoted_for_unusual_trace_ids() {
        let (registry, app) = setup();
        let pipeline = seeded_pipeline(&registry);
        let t0 = base_time();
        pipeline
            .store()
            .ingest_span(span("q\"id", "A", None, "svc1", t0, 5.0), t0);

        let res = app.oneshot(get("/traces/q%22id/export")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let disposition = res
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(disposition.starts_with("attachment; filename=\"trace-q_id-"));
        assert_eq!(disposition.matches('"').count(), 2);
    }

    #[tokio::test]
    async fn stats_and_endpoints_reflect_request_events() {
        let (registry, app) = setup();
        let pipeline = seeded_pipeline(&registry);
        let now = Utc::now();
        for status in [200, 200, 500] {
            pipeline
                .store()
                .ingest_request(&request_event(now, "/users/42", status, 10.0), now);
        }

        let res = app.clone().oneshot(get("/stats")).await.unwrap();
        let stats: Stats = read_json(res).await;
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.error_count, 1);

        let res = app.oneshot(get("/endpoints?limit=1")).await.unwrap();
        let endpoints: Vec<EndpointStat> = read_json(res).await;
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].count, 3);
    }

    #[tokio::test]
    async fn alert_rules_can_be_replaced_and_report_errors() {
        let (registry, app) = setup();
        seeded_pipeline(&registry);
        let rules = serde_json::json!([
            {"name": "slow", "metric": "p95_latency", "comparator": ">", "threshold": 500.0,
             "severity": "high", "cooldown_seconds": 60},
            {"name": "broken", "metric": "vibes", "comparator": ">", "threshold": 1.0,
             "severity": "low", "cooldown_seconds": 0}
        ]);
        let req = Request::put("/alert-rules")
            .header("x-tenant-id", "acme")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(rules.to_string()))
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let statuses: Vec<RuleStatus> = read_json(res).await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].last_error.is_none());
        assert!(statuses[1].last_error.is_some());
    }

    #[tokio::test]
    async fn tenant_lifecycle_and_status() {
        let (_registry, app) = setup();
        let res = app
            .clone()
            .oneshot(Request::post("/tenants/beta").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .clone()
            .oneshot(Request::delete("/tenants/beta").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status: StatusResponse = read_json(res).await;
        assert!(status.tenants.is_empty());
        assert_eq!(status.deactivated, vec!["beta".to_string()]);
    }

    #[tokio::test]
    async fn contract_and_service_map_are_served() {
        let (registry, app) = setup();
        let pipeline = seeded_pipeline(&registry);
        pipeline.store().generate_service_map(base_time());

        let res = app.clone().oneshot(get("/service-map")).await.unwrap();
        let map: ServiceMap = read_json(res).await;
        assert_eq!(map.services.len(), 5);

        let res = app.oneshot(get("/stream/contract")).await.unwrap();
        let contract: StreamContract = read_json(res).await;
        assert_eq!(contract.heartbeat_interval_ms, 10_000);
        assert_eq!(contract.reconnect.initial_delay_ms, 5_000);
    }
}
