use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TracepulseError};
use crate::ids::{SpanId, TraceId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanType {
    Http,
    Database,
    Cache,
    #[default]
    Service,
    Function,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    #[default]
    Ok,
    Error,
    Timeout,
}

impl SpanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub service_name: String,
    pub operation_name: String,
    pub span_type: SpanType,
    pub start_time: DateTime<Utc>,
    pub duration_ms: f64,
    pub status: SpanStatus,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Span {
    /// Saturates at the latest representable instant.
    pub fn end_time(&self) -> DateTime<Utc> {
        checked_end_time(self.start_time, self.duration_ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    pub fn is_error(&self) -> bool {
        self.status == SpanStatus::Error
    }
}

/// Wire shape accepted at the ingest boundary. Everything is optional so that
/// missing fields turn into typed ingest errors instead of opaque decode
/// failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpanPayload {
    #[serde(default, alias = "traceId")]
    pub trace_id: Option<String>,
    #[serde(default, alias = "spanId")]
    pub span_id: Option<String>,
    #[serde(default, alias = "parentSpanId")]
    pub parent_span_id: Option<String>,
    #[serde(default, alias = "serviceName", alias = "service")]
    pub service_name: Option<String>,
    #[serde(default, alias = "operationName", alias = "operation")]
    pub operation_name: Option<String>,
    #[serde(default, alias = "spanType", alias = "type")]
    pub span_type: Option<SpanType>,
    #[serde(default, alias = "startTime")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, alias = "duration")]
    pub duration_ms: Option<f64>,
    #[serde(default)]
    pub status: Option<SpanStatus>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl SpanPayload {
    pub fn into_span(self) -> Result<Span> {
        let trace_id = TraceId::parse_opt(self.trace_id.as_deref())?;
        let span_id = SpanId::parse_opt(self.span_id.as_deref())?;
        let parent_span_id = match self.parent_span_id.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(SpanId::parse(raw)?),
        };

        let duration_ms = self.duration_ms.ok_or_else(|| {
            TracepulseError::InvalidSpan(format!("span {span_id} has no duration_ms"))
        })?;
        if !duration_ms.is_finite() || duration_ms < 0.0 {
            return Err(TracepulseError::InvalidSpan(format!(
                "span {span_id} has invalid duration_ms {duration_ms}"
            )));
        }
        let start_time = self.start_time.ok_or_else(|| {
            TracepulseError::InvalidSpan(format!("span {span_id} has no start_time"))
        })?;
        if checked_end_time(start_time, duration_ms).is_none() {
            return Err(TracepulseError::InvalidSpan(format!(
                "span {span_id} ends past the representable time range"
            )));
        }

        let service_name = required_text(self.service_name, "service_name", &span_id)?;
        let operation_name = required_text(self.operation_name, "operation_name", &span_id)?;

        Ok(Span {
            trace_id,
            span_id,
            parent_span_id,
            service_name,
            operation_name,
            span_type: self.span_type.unwrap_or_default(),
            start_time,
            duration_ms,
            status: self.status.unwrap_or_default(),
            tags: self.tags,
        })
    }
}

fn checked_end_time(start: DateTime<Utc>, duration_ms: f64) -> Option<DateTime<Utc>> {
    let micros = (duration_ms * 1000.0).round();
    if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
        return None;
    }
    start.checked_add_signed(chrono::Duration::microseconds(micros as i64))
}

fn required_text(value: Option<String>, field: &str, span_id: &SpanId) -> Result<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(TracepulseError::InvalidSpan(format!(
            "span {span_id} has no {field}"
        ))),
    }
}
