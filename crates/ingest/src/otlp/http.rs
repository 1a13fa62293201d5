use std::io::Read;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use flate2::read::GzDecoder;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use prost::Message;
use tracepulse_core::error::{Result, TracepulseError};

use crate::api::{ApiResult, tenant_header};
use crate::http::IngestState;
use crate::otlp::ingest_export;

const PROTOBUF: &str = "application/x-protobuf";

/// `POST /v1/traces`: OTLP/HTTP protobuf, optionally gzip-encoded.
pub async fn export_traces(
    State(state): State<IngestState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let body = decompress(&headers, body)?;
    let req = ExportTraceServiceRequest::decode(body).map_err(|e| {
        tracing::warn!(error = %e, "otlp http traces decode failed");
        TracepulseError::Parse(format!("invalid OTLP trace export: {e}"))
    })?;

    let tenant = tenant_header(&headers)?;
    let outcome = ingest_export(&state.registry, tenant.as_ref(), &req)?;
    tracing::debug!(
        accepted = outcome.accepted,
        rejected = outcome.rejected,
        dropped_oldest = outcome.dropped_oldest,
        "otlp http traces accepted"
    );

    let payload = outcome.to_response().encode_to_vec();
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static(PROTOBUF))],
        payload,
    )
        .into_response())
}

fn decompress(headers: &HeaderMap, body: Bytes) -> Result<Bytes> {
    let gzip = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
    if !gzip {
        return Ok(body);
    }
    let mut out = Vec::new();
    GzDecoder::new(body.as_ref())
        .read_to_end(&mut out)
        .map_err(|e| TracepulseError::Parse(format!("invalid gzip body: {e}")))?;
    Ok(Bytes::from(out))
}
