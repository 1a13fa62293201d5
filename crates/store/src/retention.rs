use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracepulse_core::error::{Result, TracepulseError};
use tracepulse_core::ids::TraceId;
use tracepulse_core::query::TraceSummary;
use tracing::debug;

use crate::Store;

impl Store {
    /// Completes traces idle for `trace_idle_timeout`, then evicts the oldest
    /// completed traces beyond `trace_retention`. Returns the summaries of the
    /// traces completed by this sweep.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<TraceSummary>> {
        let idle_timeout = chrono::Duration::from_std(self.options().trace_idle_timeout)
            .map_err(|e| TracepulseError::Internal(format!("idle timeout conversion failed: {e}")))?;

        // Candidates are found under the read lock so ingest is only held up
        // for the short write section below.
        let candidates = self
            .traces_read()
            .traces
            .values()
            .filter(|trace| trace.is_idle(now, idle_timeout))
            .map(|trace| trace.trace_id().clone())
            .collect::<Vec<TraceId>>();

        let mut completed = Vec::with_capacity(candidates.len());
        let mut table = self.traces_write();
        for trace_id in candidates {
            let Some(trace) = table.traces.get_mut(&trace_id) else {
                continue;
            };
            // a span may have arrived between the two lock scopes
            if !trace.is_idle(now, idle_timeout) {
                continue;
            }
            let trace = Arc::make_mut(trace);
            trace.mark_completed();
            let seq = trace.created_seq();
            completed.push(trace.summary());
            table.completed.insert(seq, trace_id);
        }

        let evicted = evict_beyond(&mut table, self.options().trace_retention);
        if evicted > 0 {
            debug!(evicted, retained = table.completed.len(), "evicted completed traces");
        }
        Ok(completed)
    }
}

fn evict_beyond(table: &mut crate::db::TraceTable, retention: usize) -> usize {
    let mut evicted = 0;
    while table.completed.len() > retention {
        let Some((_, trace_id)) = table.completed.pop_first() else {
            break;
        };
        table.traces.remove(&trace_id);
        table.evicted += 1;
        evicted += 1;
    }
    evicted
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use tracepulse_core::ids::TraceId;
    use tracepulse_testkit::{base_time, span};

    use crate::write::SpanOutcome;
    use crate::{Store, StoreOptions};

    fn store(retention: usize) -> Store {
        Store::new(StoreOptions {
            trace_idle_timeout: Duration::from_secs(10),
            trace_retention: retention,
            ..StoreOptions::default()
        })
    }

    #[test]
    fn idle_traces_complete_and_reject_late_spans() {
        let store = store(100);
        let t0 = base_time();
        store.ingest_span(span("T", "A", None, "svc", t0, 5.0), t0);

        assert!(store.sweep(t0 + ChronoDuration::seconds(5)).unwrap().is_empty());
        let done = store.sweep(t0 + ChronoDuration::seconds(10)).unwrap();
        assert_eq!(done.len(), 1);
        assert!(done[0].completed);

        let late = store.ingest_span(
            span("T", "B", Some("A"), "svc", t0, 5.0),
            t0 + ChronoDuration::seconds(11),
        );
        assert_eq!(late, SpanOutcome::Late);
        let counts = store.trace_counts();
        assert_eq!(counts.late_spans, 1);
        assert_eq!(counts.spans, 1);
        assert!(store.sweep(t0 + ChronoDuration::seconds(30)).unwrap().is_empty());
    }

    #[test]
    fn eviction_removes_oldest_completed_and_keeps_in_flight() {
        let store = store(2);
        let t0 = base_time();
        for (i, id) in ["t1", "t2", "t3"].iter().enumerate() {
            let at = t0 + ChronoDuration::seconds(i as i64);
            store.ingest_span(span(id, "r", None, "svc", at, 1.0), at);
        }
        let busy = t0 + ChronoDuration::seconds(20);
        store.ingest_span(span("t4", "r", None, "svc", busy, 1.0), busy);

        let done = store.sweep(t0 + ChronoDuration::seconds(25)).unwrap();
        assert_eq!(done.len(), 3);

        let counts = store.trace_counts();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.active, 1);
        assert_eq!(counts.evicted, 1);
        assert!(store.trace_snapshot(&TraceId::parse("t1").unwrap()).is_none());
        assert!(store.trace_snapshot(&TraceId::parse("t3").unwrap()).is_some());
        assert!(store.trace_snapshot(&TraceId::parse("t4").unwrap()).is_some());
    }

    #[test]
    fn huge_span_duration_does_not_break_sweep() {
        let store = store(10);
        let t0 = base_time();
        store.ingest_span(span("T", "A", None, "svc", t0, 1e16), t0);

        let done = store.sweep(t0 + ChronoDuration::seconds(30)).unwrap();
        assert_eq!(done.len(), 1);
        assert!(done[0].total_duration_ms > 0.0);

        store.ingest_span(span("U", "A", None, "svc", t0, 1.0), t0);
        assert!(store.trace_snapshot(&TraceId::parse("U").unwrap()).is_some());
    }

    #[test]
    fn snapshot_taken_before_sweep_stays_incomplete() {
        let store = store(10);
        let t0 = base_time();
        store.ingest_span(span("T", "A", None, "svc", t0, 5.0), t0);
        let before = store.trace_snapshot(&TraceId::parse("T").unwrap()).unwrap();
        store.sweep(t0 + ChronoDuration::seconds(60)).unwrap();
        assert!(!before.is_completed());
        let after = store.trace_snapshot(&TraceId::parse("T").unwrap()).unwrap();
        assert!(after.is_completed());
    }
}
