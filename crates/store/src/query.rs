use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracepulse_core::error::{Result, TracepulseError};
use tracepulse_core::filter::{SortOrder, TraceFilter};
use tracepulse_core::ids::TraceId;
use tracepulse_core::model::alert::{Alert, RuleStatus};
use tracepulse_core::model::service::ServiceMap;
use tracepulse_core::model::stats::{EndpointStat, MetricKind, Stats, TimeSeries};
use tracepulse_core::query::{TraceExport, TraceResponse, TraceSummary};

use crate::Store;
use crate::service_map::build_service_map;
use crate::trace::Trace;

impl Store {
    /// Cheap copy-on-read handle; later writes never show through it.
    pub fn trace_snapshot(&self, trace_id: &TraceId) -> Option<Arc<Trace>> {
        self.traces_read().traces.get(trace_id).cloned()
    }

    fn all_snapshots(&self) -> Vec<Arc<Trace>> {
        self.traces_read().traces.values().cloned().collect()
    }

    pub fn get_trace(&self, trace_id: &TraceId) -> Result<TraceResponse> {
        self.trace_snapshot(trace_id)
            .map(|trace| trace.to_response())
            .ok_or_else(|| TracepulseError::TraceNotFound(trace_id.to_string()))
    }

    pub fn export_trace(&self, trace_id: &TraceId) -> Result<TraceExport> {
        self.trace_snapshot(trace_id)
            .map(|trace| trace.to_export())
            .ok_or_else(|| TracepulseError::TraceNotFound(trace_id.to_string()))
    }

    pub fn list_traces(&self, filter: &TraceFilter) -> Vec<TraceSummary> {
        let mut items = self
            .all_snapshots()
            .iter()
            .filter(|trace| matches_filter(trace, filter))
            .map(|trace| trace.summary())
            .collect::<Vec<_>>();

        match filter.sort {
            SortOrder::TsAsc => items.sort_by(|a, b| {
                a.start_time
                    .cmp(&b.start_time)
                    .then_with(|| a.trace_id.cmp(&b.trace_id))
            }),
            SortOrder::TsDesc => items.sort_by(|a, b| {
                b.start_time
                    .cmp(&a.start_time)
                    .then_with(|| a.trace_id.cmp(&b.trace_id))
            }),
            SortOrder::DurationDesc => items.sort_by(|a, b| {
                b.total_duration_ms
                    .total_cmp(&a.total_duration_ms)
                    .then_with(|| a.trace_id.cmp(&b.trace_id))
            }),
        }

        items.truncate(filter.limit);
        items
    }

    pub fn rotate_metrics(&self, now: DateTime<Utc>) {
        self.metrics().rotate(now);
    }

    pub fn current_stats(&self, now: DateTime<Utc>, dropped_events: u64) -> Stats {
        self.metrics().current_stats(now, dropped_events)
    }

    pub fn top_endpoints(&self, n: usize) -> Vec<EndpointStat> {
        self.metrics().top_n_endpoints(n)
    }

    pub fn time_series(&self, metric: MetricKind, dropped_events: u64) -> TimeSeries {
        self.metrics().time_series(metric, dropped_events)
    }

    /// Rebuilds the service map from trace snapshots and publishes it. The
    /// trace table lock is only held while cloning the snapshot handles.
    pub fn generate_service_map(&self, now: DateTime<Utc>) -> Arc<ServiceMap> {
        let snapshots = self.all_snapshots();
        let opts = self.options();
        let map = Arc::new(build_service_map(
            snapshots.iter().map(Arc::as_ref),
            now,
            opts.service_map_lookback,
            opts.service_map_top_operations,
        ));
        self.swap_service_map(map.clone());
        map
    }

    pub fn evaluate_alerts(&self, stats: &Stats, now: DateTime<Utc>) -> Vec<Alert> {
        self.alerts().evaluate(stats, now)
    }

    pub fn alert_history(&self, limit: usize) -> Vec<Alert> {
        self.alerts().history(limit)
    }

    pub fn alert_rules(&self) -> Vec<RuleStatus> {
        self.alerts().rules().to_vec()
    }
}

fn matches_filter(trace: &Trace, filter: &TraceFilter) -> bool {
    if let Some(service) = &filter.service
        && !trace.spans().any(|s| service.matches(&s.service_name))
    {
        return false;
    }
    if let Some(operation) = &filter.operation
        && !trace.spans().any(|s| operation.matches(&s.operation_name))
    {
        return false;
    }
    let duration = trace.total_duration_ms();
    if filter.min_duration_ms.is_some_and(|min| duration < min) {
        return false;
    }
    if filter.max_duration_ms.is_some_and(|max| duration > max) {
        return false;
    }
    if filter.error_only && trace.error_count() == 0 {
        return false;
    }
    filter.window.contains(trace.start_time())
}
