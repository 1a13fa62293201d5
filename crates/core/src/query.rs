use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TracepulseError};
use crate::filter::{NameFilter, SortOrder, TimeWindow, TraceFilter};
use crate::ids::{SpanId, TraceId};
use crate::model::span::{Span, SpanStatus};
use crate::time::{parse_time_or_relative, parse_time_range};

pub const EXPORT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceSummary {
    pub trace_id: TraceId,
    pub root_service: String,
    pub root_operation: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_duration_ms: f64,
    pub span_count: usize,
    pub error_count: usize,
    pub services: Vec<String>,
    pub status: SpanStatus,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HierarchyEntry {
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub depth: usize,
    pub synthetic: bool,
}

/// Depth-first rendering order of a trace's spans.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceHierarchy {
    pub entries: Vec<HierarchyEntry>,
    pub orphan_count: usize,
    /// Set when parent links loop; `entries` is then a flat listing.
    pub cyclic: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceResponse {
    pub summary: TraceSummary,
    pub spans: Vec<Span>,
    pub hierarchy: TraceHierarchy,
}

/// Portable trace document. Serialization is deterministic for a given span
/// set: spans are ordered by (start_time, span_id) and tags are key-sorted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceExport {
    pub format_version: u32,
    pub trace_id: TraceId,
    pub start_time: DateTime<Utc>,
    pub total_duration_ms: f64,
    pub span_count: usize,
    pub error_count: usize,
    pub services: Vec<String>,
    pub spans: Vec<Span>,
}

impl TraceExport {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| TracepulseError::Internal(format!("trace export encode failed: {e}")))
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let doc: Self = serde_json::from_slice(bytes)
            .map_err(|e| TracepulseError::Parse(format!("invalid trace export: {e}")))?;
        if doc.format_version != EXPORT_FORMAT_VERSION {
            return Err(TracepulseError::Parse(format!(
                "unsupported trace export version {}",
                doc.format_version
            )));
        }
        Ok(doc)
    }

    pub fn filename(&self, now: DateTime<Utc>) -> String {
        export_filename(&self.trace_id, now)
    }
}

/// Trace ids may hold any printable text; everything outside `[A-Za-z0-9._-]`
/// becomes `_` so the name is safe in a quoted header and as a path.
pub fn export_filename(trace_id: &TraceId, now: DateTime<Utc>) -> String {
    let safe_id = trace_id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    format!("trace-{}-{}.json", safe_id, now.timestamp_millis())
}

/// Query-string form of a trace listing, shared by the HTTP server and the
/// CLI client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracesQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<f64>,
    #[serde(default)]
    pub error_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl TracesQuery {
    pub fn into_filter(self) -> Result<TraceFilter> {
        let mut window = match self.time_range.as_deref() {
            Some(range) => parse_time_range(range)?,
            None => TimeWindow::all(),
        };
        if let Some(since) = self.since.as_deref() {
            window.since = Some(parse_time_or_relative(since)?);
        }
        if let Some(until) = self.until.as_deref() {
            window.until = Some(parse_time_or_relative(until)?);
        }

        if let (Some(min), Some(max)) = (self.min_duration, self.max_duration)
            && min > max
        {
            return Err(TracepulseError::InvalidArgument(format!(
                "min_duration {min} exceeds max_duration {max}"
            )));
        }

        Ok(TraceFilter {
            service: self.service.as_deref().map(NameFilter::parse).transpose()?,
            operation: self.operation.as_deref().map(NameFilter::parse).transpose()?,
            min_duration_ms: self.min_duration,
            max_duration_ms: self.max_duration,
            error_only: self.error_only,
            window,
            sort: self
                .sort
                .as_deref()
                .map(str::parse::<SortOrder>)
                .transpose()?
                .unwrap_or_default(),
            limit: self.limit.unwrap_or(100).clamp(1, 10_000),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantStatus {
    pub tenant_id: String,
    pub active_traces: usize,
    pub completed_traces: usize,
    pub span_count: usize,
    pub late_spans: u64,
    pub evicted_traces: u64,
    pub queue_depth: usize,
    pub dropped_events: u64,
    pub subscribers: usize,
    pub alert_rules: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub version: String,
    pub tenants: Vec<TenantStatus>,
    pub deactivated: Vec<String>,
}
