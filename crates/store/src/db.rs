use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use tracepulse_core::config::Config;
use tracepulse_core::ids::TraceId;
use tracepulse_core::model::alert::AlertRule;
use tracepulse_core::model::service::ServiceMap;

use crate::aggregator::MetricsAggregator;
use crate::alert::AlertEvaluator;
use crate::trace::Trace;

/// Tuning for one tenant's in-memory state.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub trace_idle_timeout: Duration,
    pub trace_retention: usize,
    pub bucket_width: Duration,
    pub window_buckets: usize,
    pub service_map_lookback: Duration,
    pub service_map_top_operations: usize,
    pub alert_history: usize,
    pub alert_rules: Vec<AlertRule>,
}

impl StoreOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            trace_idle_timeout: cfg.trace_idle_timeout,
            trace_retention: cfg.trace_retention,
            bucket_width: cfg.bucket_width,
            window_buckets: cfg.window_buckets,
            service_map_lookback: cfg.service_map_lookback,
            service_map_top_operations: cfg.service_map_top_operations,
            alert_history: cfg.alert_history,
            alert_rules: cfg.alert_rules.clone(),
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Default)]
pub(crate) struct TraceTable {
    pub(crate) traces: HashMap<TraceId, Arc<Trace>>,
    /// Completed traces keyed by creation sequence, oldest first.
    pub(crate) completed: BTreeMap<u64, TraceId>,
    pub(crate) next_seq: u64,
    pub(crate) late_spans: u64,
    pub(crate) evicted: u64,
}

struct Inner {
    opts: StoreOptions,
    traces: RwLock<TraceTable>,
    metrics: Mutex<MetricsAggregator>,
    service_map: RwLock<Arc<ServiceMap>>,
    alerts: Mutex<AlertEvaluator>,
}

/// One tenant's trace store, metric window, service map and alert state.
/// Cloning shares the same state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceCounts {
    pub active: usize,
    pub completed: usize,
    pub spans: usize,
    pub late_spans: u64,
    pub evicted: u64,
}

impl Store {
    pub fn new(opts: StoreOptions) -> Self {
        let metrics = MetricsAggregator::new(opts.bucket_width, opts.window_buckets);
        let alerts = AlertEvaluator::new(opts.alert_rules.clone(), opts.alert_history);
        let service_map = ServiceMap::empty(Utc::now(), opts.service_map_lookback.as_secs());
        Self {
            inner: Arc::new(Inner {
                opts,
                traces: RwLock::new(TraceTable::default()),
                metrics: Mutex::new(metrics),
                service_map: RwLock::new(Arc::new(service_map)),
                alerts: Mutex::new(alerts),
            }),
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.opts
    }

    pub(crate) fn traces_read(&self) -> RwLockReadGuard<'_, TraceTable> {
        self.inner.traces.read().expect("trace table lock poisoned")
    }

    pub(crate) fn traces_write(&self) -> RwLockWriteGuard<'_, TraceTable> {
        self.inner.traces.write().expect("trace table lock poisoned")
    }

    pub(crate) fn metrics(&self) -> MutexGuard<'_, MetricsAggregator> {
        self.inner.metrics.lock().expect("metrics mutex poisoned")
    }

    pub(crate) fn alerts(&self) -> MutexGuard<'_, AlertEvaluator> {
        self.inner.alerts.lock().expect("alerts mutex poisoned")
    }

    pub(crate) fn swap_service_map(&self, map: Arc<ServiceMap>) {
        *self
            .inner
            .service_map
            .write()
            .expect("service map lock poisoned") = map;
    }

    /// Latest service map snapshot. Later rebuilds never mutate it.
    pub fn service_map(&self) -> Arc<ServiceMap> {
        self.inner
            .service_map
            .read()
            .expect("service map lock poisoned")
            .clone()
    }

    pub fn trace_counts(&self) -> TraceCounts {
        let table = self.traces_read();
        let spans = table.traces.values().map(|t| t.span_count()).sum();
        TraceCounts {
            active: table.traces.len() - table.completed.len(),
            completed: table.completed.len(),
            spans,
            late_spans: table.late_spans,
            evicted: table.evicted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_store_is_empty() {
        let store = Store::new(StoreOptions::default());
        let counts = store.trace_counts();
        assert_eq!(counts.active, 0);
        assert_eq!(counts.completed, 0);
        assert_eq!(counts.spans, 0);
        assert!(store.service_map().services.is_empty());
        assert_eq!(store.options().window_buckets, 60);
    }
}
