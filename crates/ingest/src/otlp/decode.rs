use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::Span as OtlpSpan;
use opentelemetry_proto::tonic::trace::v1::span::SpanKind;
use opentelemetry_proto::tonic::trace::v1::status::StatusCode;
use tracepulse_core::error::Result;
use tracepulse_core::model::span::{Span, SpanPayload, SpanStatus, SpanType};

pub const TENANT_ATTRIBUTE: &str = "tenant.id";

/// Spans of one OTLP resource, with the tenant the resource declares.
#[derive(Debug, Default)]
pub struct ResourceBatch {
    pub tenant: Option<String>,
    pub spans: Vec<Span>,
    pub rejected: Vec<String>,
}

pub fn decode_export(req: &ExportTraceServiceRequest) -> Vec<ResourceBatch> {
    req.resource_spans
        .iter()
        .map(|rs| {
            let resource = rs.resource.as_ref();
            let mut batch = ResourceBatch {
                tenant: resource_attr(resource, TENANT_ATTRIBUTE),
                ..ResourceBatch::default()
            };
            for span in rs.scope_spans.iter().flat_map(|ss| ss.spans.iter()) {
                match decode_span(resource, span) {
                    Ok(span) => batch.spans.push(span),
                    Err(err) => batch.rejected.push(err.to_string()),
                }
            }
            batch
        })
        .collect()
}

/// Converts one OTLP span, applying the same validation as JSON ingest.
pub fn decode_span(resource: Option<&Resource>, span: &OtlpSpan) -> Result<Span> {
    let tags = span
        .attributes
        .iter()
        .map(|kv| (kv.key.clone(), any_value_to_string(kv.value.as_ref())))
        .collect::<BTreeMap<_, _>>();

    let status = match span.status.as_ref() {
        Some(s) if s.code == StatusCode::Error as i32 => SpanStatus::Error,
        _ => SpanStatus::Ok,
    };
    let span_type = span_type(span.kind, &tags);
    let mut tags = tags;
    if let Some(message) = span.status.as_ref().map(|s| s.message.as_str())
        && !message.is_empty()
    {
        tags.insert("otel.status_description".to_string(), message.to_string());
    }

    let duration_ms =
        (span.end_time_unix_nano as f64 - span.start_time_unix_nano as f64) / 1_000_000.0;

    SpanPayload {
        trace_id: bytes_to_hex(&span.trace_id),
        span_id: bytes_to_hex(&span.span_id),
        parent_span_id: bytes_to_hex(&span.parent_span_id),
        service_name: Some(service_name(resource)),
        operation_name: Some(span.name.clone()),
        span_type: Some(span_type),
        start_time: Some(nanos_to_dt(span.start_time_unix_nano)),
        duration_ms: Some(duration_ms),
        status: Some(status),
        tags,
    }
    .into_span()
}

fn span_type(kind: i32, tags: &BTreeMap<String, String>) -> SpanType {
    if let Some(system) = tags.get("db.system") {
        return match system.as_str() {
            "redis" | "memcached" => SpanType::Cache,
            _ => SpanType::Database,
        };
    }
    if tags.keys().any(|k| k.starts_with("http.")) {
        return SpanType::Http;
    }
    if kind == SpanKind::Internal as i32 {
        return SpanType::Function;
    }
    SpanType::Service
}

fn service_name(resource: Option<&Resource>) -> String {
    resource_attr(resource, "service.name").unwrap_or_else(|| "unknown".to_string())
}

fn resource_attr(resource: Option<&Resource>, key: &str) -> Option<String> {
    resource?
        .attributes
        .iter()
        .find(|kv: &&KeyValue| kv.key == key)
        .map(|kv| any_value_to_string(kv.value.as_ref()))
        .filter(|v| !v.trim().is_empty())
}

fn any_value_to_string(value: Option<&AnyValue>) -> String {
    value
        .and_then(|v| v.value.as_ref())
        .map(|v| match v {
            any_value::Value::StringValue(s) => s.clone(),
            any_value::Value::BoolValue(b) => b.to_string(),
            any_value::Value::IntValue(i) => i.to_string(),
            any_value::Value::DoubleValue(d) => d.to_string(),
            any_value::Value::BytesValue(b) => String::from_utf8_lossy(b).to_string(),
            _ => "<complex>".to_string(),
        })
        .unwrap_or_default()
}

fn bytes_to_hex(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    Some(bytes.iter().map(|b| format!("{b:02x}")).collect::<String>())
}

fn nanos_to_dt(nanos: u64) -> chrono::DateTime<Utc> {
    let secs = (nanos / 1_000_000_000) as i64;
    let subnanos = (nanos % 1_000_000_000) as u32;
    Utc.timestamp_opt(secs, subnanos)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use tracepulse_core::ErrorKind;
    use tracepulse_testkit::{base_time, otlp_trace_request};

    use super::*;

    #[test]
    fn decodes_export_with_tenant_and_types() {
        let req = otlp_trace_request("checkout", Some("acme"));
        let batches = decode_export(&req);
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.tenant.as_deref(), Some("acme"));
        assert!(batch.rejected.is_empty());

        let root = &batch.spans[0];
        assert_eq!(root.trace_id.as_str(), "abababababababababababababababab");
        assert_eq!(root.span_id.as_str(), "0101010101010101");
        assert!(root.parent_span_id.is_none());
        assert_eq!(root.service_name, "checkout");
        assert_eq!(root.span_type, SpanType::Http);
        assert_eq!(root.start_time, base_time());
        assert_eq!(root.duration_ms, 100.0);

        let child = &batch.spans[1];
        assert_eq!(child.parent_span_id.as_ref().unwrap().as_str(), "0101010101010101");
        assert_eq!(child.span_type, SpanType::Database);
        assert_eq!(child.status, SpanStatus::Error);
        assert_eq!(child.duration_ms, 40.0);
        assert_eq!(child.tags["otel.status_description"], "timeout");
    }

    #[test]
    fn spans_without_ids_are_rejected_individually() {
        let mut req = otlp_trace_request("checkout", None);
        req.resource_spans[0].scope_spans[0].spans[1].span_id.clear();
        let batch = &decode_export(&req)[0];
        assert_eq!(batch.tenant, None);
        assert_eq!(batch.spans.len(), 1);
        assert_eq!(batch.rejected.len(), 1);
    }

    #[test]
    fn end_before_start_is_invalid() {
        let span = OtlpSpan {
            trace_id: vec![1; 16],
            span_id: vec![2; 8],
            name: "call".into(),
            start_time_unix_nano: 2_000,
            end_time_unix_nano: 1_000,
            ..Default::default()
        };
        let err = decode_span(None, &span).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSpan);
    }

    #[test]
    fn internal_spans_are_functions_and_redis_is_cache() {
        let mut span = OtlpSpan {
            trace_id: vec![1; 16],
            span_id: vec![2; 8],
            name: "compute".into(),
            kind: SpanKind::Internal as i32,
            start_time_unix_nano: 1_700_000_000_000_000_000,
            end_time_unix_nano: 1_700_000_000_001_000_000,
            ..Default::default()
        };
        assert_eq!(decode_span(None, &span).unwrap().span_type, SpanType::Function);

        span.attributes.push(KeyValue {
            key: "db.system".into(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue("redis".into())),
            }),
        });
        let decoded = decode_span(None, &span).unwrap();
        assert_eq!(decoded.span_type, SpanType::Cache);
        assert_eq!(decoded.service_name, "unknown");
    }
}
