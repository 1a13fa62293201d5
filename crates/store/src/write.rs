use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracepulse_core::model::alert::AlertRule;
use tracepulse_core::model::request::RequestEvent;
use tracepulse_core::model::span::Span;

use crate::Store;
use crate::trace::Trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanOutcome {
    /// First span of a new trace.
    Created,
    Appended,
    /// Same span id already present; nothing changed.
    Duplicate,
    /// The trace already completed; the span was dropped and counted.
    Late,
}

impl Store {
    pub fn ingest_span(&self, span: Span, received_at: DateTime<Utc>) -> SpanOutcome {
        let mut table = self.traces_write();
        if let Some(trace) = table.traces.get(&span.trace_id) {
            if trace.is_completed() {
                table.late_spans += 1;
                return SpanOutcome::Late;
            }
            if trace.contains(&span.span_id) {
                return SpanOutcome::Duplicate;
            }
        }

        if let Some(trace) = table.traces.get_mut(&span.trace_id) {
            Arc::make_mut(trace).insert(span, received_at);
            return SpanOutcome::Appended;
        }

        let seq = table.next_seq;
        table.next_seq += 1;
        let trace_id = span.trace_id.clone();
        table
            .traces
            .insert(trace_id, Arc::new(Trace::new(span, seq, received_at)));
        SpanOutcome::Created
    }

    pub fn ingest_spans(&self, spans: Vec<Span>, received_at: DateTime<Utc>) -> Vec<SpanOutcome> {
        spans
            .into_iter()
            .map(|span| self.ingest_span(span, received_at))
            .collect()
    }

    /// Returns false when the event fell behind the metric window or ran too
    /// far ahead of `received_at`.
    pub fn ingest_request(&self, event: &RequestEvent, received_at: DateTime<Utc>) -> bool {
        self.metrics().record(event, received_at)
    }

    pub fn replace_alert_rules(&self, rules: Vec<AlertRule>) {
        self.alerts().replace_rules(rules);
    }
}
