use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracepulse_core::ids::{SpanId, TraceId};
use tracepulse_core::model::span::{Span, SpanStatus};
use tracepulse_core::query::{
    EXPORT_FORMAT_VERSION, TraceExport, TraceResponse, TraceSummary,
};

use crate::tree::build_hierarchy;

/// Spans sharing one trace id. Cloned on write while readers hold a snapshot.
#[derive(Debug, Clone)]
pub struct Trace {
    trace_id: TraceId,
    spans: BTreeMap<SpanId, Span>,
    created_seq: u64,
    last_updated: DateTime<Utc>,
    completed: bool,
}

impl Trace {
    pub fn new(span: Span, created_seq: u64, received_at: DateTime<Utc>) -> Self {
        let mut spans = BTreeMap::new();
        let trace_id = span.trace_id.clone();
        spans.insert(span.span_id.clone(), span);
        Self {
            trace_id,
            spans,
            created_seq,
            last_updated: received_at,
            completed: false,
        }
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    pub fn created_seq(&self) -> u64 {
        self.created_seq
    }

    /// Arrival time of the most recent new span.
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn contains(&self, span_id: &SpanId) -> bool {
        self.spans.contains_key(span_id)
    }

    pub fn span(&self, span_id: &SpanId) -> Option<&Span> {
        self.spans.get(span_id)
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// Adds a span unless one with the same id is already present. Returns
    /// whether the span was new.
    pub fn insert(&mut self, span: Span, received_at: DateTime<Utc>) -> bool {
        if self.spans.contains_key(&span.span_id) {
            return false;
        }
        self.spans.insert(span.span_id.clone(), span);
        if received_at > self.last_updated {
            self.last_updated = received_at;
        }
        true
    }

    pub fn is_idle(&self, now: DateTime<Utc>, idle_timeout: chrono::Duration) -> bool {
        !self.completed && now - self.last_updated >= idle_timeout
    }

    pub(crate) fn mark_completed(&mut self) {
        self.completed = true;
    }

    pub fn spans(&self) -> impl Iterator<Item = &Span> {
        self.spans.values()
    }

    /// Spans ordered by start time, span id breaking ties.
    pub fn sorted_spans(&self) -> Vec<&Span> {
        let mut spans = self.spans.values().collect::<Vec<_>>();
        spans.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.span_id.cmp(&b.span_id))
        });
        spans
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.spans
            .values()
            .map(|s| s.start_time)
            .min()
            .unwrap_or(self.last_updated)
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.spans
            .values()
            .map(Span::end_time)
            .max()
            .unwrap_or(self.last_updated)
    }

    pub fn total_duration_ms(&self) -> f64 {
        let elapsed = self.end_time() - self.start_time();
        elapsed
            .num_microseconds()
            .map(|us| us as f64 / 1000.0)
            .unwrap_or_else(|| elapsed.num_milliseconds() as f64)
    }

    pub fn error_count(&self) -> usize {
        self.spans.values().filter(|s| s.is_error()).count()
    }

    pub fn services(&self) -> BTreeSet<&str> {
        self.spans
            .values()
            .map(|s| s.service_name.as_str())
            .collect()
    }

    /// Earliest real root, or the earliest span when the root has not arrived.
    pub fn root_span(&self) -> Option<&Span> {
        let sorted = self.sorted_spans();
        sorted
            .iter()
            .find(|s| s.is_root())
            .or_else(|| sorted.first())
            .copied()
    }

    pub fn status(&self) -> SpanStatus {
        let mut status = SpanStatus::Ok;
        for span in self.spans.values() {
            match span.status {
                SpanStatus::Error => return SpanStatus::Error,
                SpanStatus::Timeout => status = SpanStatus::Timeout,
                SpanStatus::Ok => {}
            }
        }
        status
    }

    pub fn summary(&self) -> TraceSummary {
        let (root_service, root_operation) = self
            .root_span()
            .map(|s| (s.service_name.clone(), s.operation_name.clone()))
            .unwrap_or_default();
        TraceSummary {
            trace_id: self.trace_id.clone(),
            root_service,
            root_operation,
            start_time: self.start_time(),
            end_time: self.end_time(),
            total_duration_ms: self.total_duration_ms(),
            span_count: self.spans.len(),
            error_count: self.error_count(),
            services: self.services().into_iter().map(str::to_string).collect(),
            status: self.status(),
            completed: self.completed,
        }
    }

    pub fn to_response(&self) -> TraceResponse {
        let sorted = self.sorted_spans();
        let hierarchy = build_hierarchy(&sorted);
        TraceResponse {
            summary: self.summary(),
            spans: sorted.into_iter().cloned().collect(),
            hierarchy,
        }
    }

    pub fn to_export(&self) -> TraceExport {
        TraceExport {
            format_version: EXPORT_FORMAT_VERSION,
            trace_id: self.trace_id.clone(),
            start_time: self.start_time(),
            total_duration_ms: self.total_duration_ms(),
            span_count: self.spans.len(),
            error_count: self.error_count(),
            services: self.services().into_iter().map(str::to_string).collect(),
            spans: self.sorted_spans().into_iter().cloned().collect(),
        }
    }
}
