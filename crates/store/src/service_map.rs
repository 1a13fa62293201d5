use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracepulse_core::model::service::{OperationCount, ServiceEdge, ServiceMap, ServiceNode};

use crate::trace::Trace;

#[derive(Default)]
struct ServiceAccumulator {
    requests: u64,
    spans: u64,
    errors: u64,
    duration_sum_ms: f64,
    operations: HashMap<String, u64>,
}

/// Derives the service directory from traces touched within `lookback` of
/// `now`. A span is a request into its service when it is a root, an orphan,
/// or its parent ran in another service.
pub fn build_service_map<'a>(
    traces: impl IntoIterator<Item = &'a Trace>,
    now: DateTime<Utc>,
    lookback: Duration,
    top_operations: usize,
) -> ServiceMap {
    let cutoff = chrono::Duration::from_std(lookback)
        .ok()
        .and_then(|lookback| now.checked_sub_signed(lookback));
    let mut services: BTreeMap<String, ServiceAccumulator> = BTreeMap::new();
    let mut edges: BTreeMap<(String, String), (u64, u64)> = BTreeMap::new();
    let mut trace_count = 0;

    for trace in traces {
        if let Some(cutoff) = cutoff
            && trace.last_updated() < cutoff
        {
            continue;
        }
        trace_count += 1;

        for span in trace.spans() {
            let parent_service = span
                .parent_span_id
                .as_ref()
                .and_then(|parent| trace.span(parent))
                .map(|parent| parent.service_name.as_str());

            let acc = services.entry(span.service_name.clone()).or_default();
            acc.spans += 1;
            acc.duration_sum_ms += span.duration_ms;
            if span.is_error() {
                acc.errors += 1;
            }
            *acc.operations.entry(span.operation_name.clone()).or_default() += 1;

            match parent_service {
                Some(caller) if caller == span.service_name => {}
                Some(caller) => {
                    acc.requests += 1;
                    let edge = edges
                        .entry((caller.to_string(), span.service_name.clone()))
                        .or_default();
                    edge.0 += 1;
                    if span.is_error() {
                        edge.1 += 1;
                    }
                }
                None => acc.requests += 1,
            }
        }
    }

    let services = services
        .into_iter()
        .map(|(name, acc)| {
            let mut operations = acc
                .operations
                .into_iter()
                .map(|(name, count)| OperationCount { name, count })
                .collect::<Vec<_>>();
            operations.sort_by(|a, b| {
                Reverse(a.count)
                    .cmp(&Reverse(b.count))
                    .then_with(|| a.name.cmp(&b.name))
            });
            operations.truncate(top_operations);

            let spans = acc.spans.max(1) as f64;
            ServiceNode {
                name,
                request_count: acc.requests,
                span_count: acc.spans,
                error_count: acc.errors,
                error_rate: acc.errors as f64 / spans,
                avg_duration_ms: acc.duration_sum_ms / spans,
                operations,
            }
        })
        .collect();

    let edges = edges
        .into_iter()
        .map(|((caller, callee), (calls, errors))| ServiceEdge {
            caller,
            callee,
            call_count: calls,
            error_count: errors,
        })
        .collect();

    ServiceMap {
        generated_at: now,
        lookback_seconds: lookback.as_secs(),
        trace_count,
        services,
        edges,
    }
}
