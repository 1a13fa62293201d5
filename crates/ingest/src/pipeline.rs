use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracepulse_core::ErrorKind;
use tracepulse_core::config::Config;
use tracepulse_core::error::{Result, TracepulseError};
use tracepulse_core::ids::TenantId;
use tracepulse_core::model::alert::Alert;
use tracepulse_core::model::request::RequestEvent;
use tracepulse_core::model::span::Span;
use tracepulse_core::model::stats::Stats;
use tracepulse_core::query::TenantStatus;
use tracepulse_core::stream::{MessageType, StreamContract, SubscribeRequest, Topic};
use tracepulse_store::{SpanOutcome, Store, StoreOptions};
use tracing::{debug, info, warn};

use crate::hub::{Subscription, SubscriptionHub};
use crate::queue::{IngestEvent, PushReceipt, TenantQueue};

/// What one scheduler tick did.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub stats: Stats,
    pub completed_traces: usize,
    pub alerts: Vec<Alert>,
    pub service_map_rebuilt: bool,
    pub disconnected: usize,
    pub elapsed: Duration,
}

/// One tenant's ingest queue, store and subscription hub, plus the worker
/// and scheduler tasks that drive them.
pub struct TenantPipeline {
    tenant: TenantId,
    cfg: Arc<Config>,
    store: Store,
    queue: Arc<TenantQueue>,
    hub: Arc<SubscriptionHub>,
    active: AtomicBool,
    last_service_map: Mutex<Option<DateTime<Utc>>>,
    // serializes ticks when one is triggered outside the scheduler
    tick_lock: AsyncMutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TenantPipeline {
    /// Builds the pipeline and spawns its tasks on the current runtime.
    pub fn start(tenant: TenantId, cfg: Arc<Config>) -> Arc<Self> {
        let pipeline = Arc::new(Self::new(tenant, cfg));

        let worker = tokio::spawn(run_worker(
            pipeline.tenant.clone(),
            pipeline.store.clone(),
            pipeline.queue.clone(),
            pipeline.hub.clone(),
        ));
        let scheduler = tokio::spawn(run_scheduler(
            Arc::downgrade(&pipeline),
            pipeline.cfg.tick_interval,
            pipeline.cfg.heartbeat_interval,
        ));
        pipeline.tasks().extend([worker, scheduler]);

        info!(tenant = %pipeline.tenant, "tenant pipeline started");
        pipeline
    }

    fn new(tenant: TenantId, cfg: Arc<Config>) -> Self {
        let store = Store::new(StoreOptions::from_config(&cfg));
        let queue = Arc::new(TenantQueue::new(cfg.queue_capacity));
        let hub = Arc::new(SubscriptionHub::new(tenant.clone(), cfg.subscriber_outbox));
        Self {
            tenant,
            cfg,
            store,
            queue,
            hub,
            active: AtomicBool::new(true),
            last_service_map: Mutex::new(None),
            tick_lock: AsyncMutex::new(()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().expect("pipeline task list poisoned")
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn hub(&self) -> &SubscriptionHub {
        &self.hub
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(TracepulseError::TenantInactive(format!(
                "tenant {} is deactivated",
                self.tenant
            )))
        }
    }

    /// Enqueues a validated span; never waits for processing.
    pub fn ingest_span(&self, span: Span) -> Result<PushReceipt> {
        self.ensure_active()?;
        self.push(IngestEvent::Span(span))
    }

    pub fn ingest_request(&self, event: RequestEvent) -> Result<PushReceipt> {
        self.ensure_active()?;
        self.push(IngestEvent::Request(event))
    }

    fn push(&self, event: IngestEvent) -> Result<PushReceipt> {
        let receipt = self.queue.push(event)?;
        if receipt.dropped_oldest {
            debug!(
                tenant = %self.tenant,
                dropped = self.queue.dropped(),
                "ingest queue full; dropped oldest event"
            );
        }
        Ok(receipt)
    }

    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped()
    }

    /// Stats for the current window without advancing it.
    pub fn stats(&self, now: DateTime<Utc>) -> Stats {
        self.store.current_stats(now, self.queue.dropped())
    }

    /// Runs one scheduler tick: trace completion, window rotation, alert
    /// evaluation, a service map rebuild when due, then fan-out.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let _guard = self.tick_lock.lock().await;
        let started = Instant::now();

        let completed = match self.store.sweep(now) {
            Ok(completed) => completed,
            Err(err) => {
                warn!(tenant = %self.tenant, error = %err, "trace sweep failed");
                Vec::new()
            }
        };
        self.store.rotate_metrics(now);
        let stats = self.stats(now);
        let alerts = self.store.evaluate_alerts(&stats, now);
        let service_map_rebuilt = self.rebuild_service_map_if_due(now);

        let mut disconnected = 0;
        disconnected += self
            .hub
            .publish(MessageType::StatsUpdate, to_data(&stats))
            .disconnected;
        if self.hub.wants_topic(Topic::Endpoints) {
            let endpoints = self.store.top_endpoints(self.cfg.top_endpoints);
            disconnected += self
                .hub
                .publish(MessageType::Endpoints, to_data(&endpoints))
                .disconnected;
        }
        for series in self.hub.series_wanted() {
            let points = self.store.time_series(series, self.queue.dropped());
            disconnected += self.hub.publish_series(series, to_data(&points)).disconnected;
        }
        for alert in &alerts {
            info!(
                tenant = %self.tenant,
                rule = %alert.rule,
                value = alert.value,
                threshold = alert.threshold,
                "alert fired"
            );
            disconnected += self
                .hub
                .publish(MessageType::Alert, to_data(alert))
                .disconnected;
        }
        for summary in &completed {
            disconnected += self
                .hub
                .publish(MessageType::Trace, to_data(summary))
                .disconnected;
        }

        let elapsed = started.elapsed();
        if elapsed > self.cfg.tick_budget {
            warn!(
                tenant = %self.tenant,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.cfg.tick_budget.as_millis() as u64,
                "tick exceeded its budget"
            );
        }

        TickReport {
            stats,
            completed_traces: completed.len(),
            alerts,
            service_map_rebuilt,
            disconnected,
            elapsed,
        }
    }

    fn rebuild_service_map_if_due(&self, now: DateTime<Utc>) -> bool {
        let mut last = self
            .last_service_map
            .lock()
            .expect("service map schedule poisoned");
        let interval = chrono::Duration::from_std(self.cfg.service_map_interval)
            .unwrap_or(chrono::Duration::MAX);
        let due = match *last {
            None => true,
            Some(previous) => now.signed_duration_since(previous) >= interval,
        };
        if due {
            let map = self.store.generate_service_map(now);
            debug!(
                tenant = %self.tenant,
                services = map.services.len(),
                edges = map.edges.len(),
                "service map rebuilt"
            );
            *last = Some(now);
        }
        due
    }

    /// Registers a subscriber; its first frame is the `initial` snapshot.
    pub fn subscribe(&self, req: &SubscribeRequest) -> Result<Subscription> {
        self.ensure_active()?;
        let now = Utc::now();
        let stats = self.stats(now);
        let resync = req
            .last_seq
            .is_some_and(|seen| seen < self.hub.current_seq());
        let initial = serde_json::json!({
            "tenant": self.tenant,
            "stats": stats,
            "endpoints": self.store.top_endpoints(self.cfg.top_endpoints),
            "status_codes": stats.status_codes,
            "contract": StreamContract::from_config(&self.cfg),
            "topics": req.topics,
            "series": req.series,
            "resync": resync,
        });
        Ok(self.hub.subscribe(req, initial))
    }

    pub fn heartbeat(&self, now: DateTime<Utc>) {
        self.hub.heartbeat(now);
    }

    pub fn status(&self) -> TenantStatus {
        let counts = self.store.trace_counts();
        TenantStatus {
            tenant_id: self.tenant.to_string(),
            active_traces: counts.active,
            completed_traces: counts.completed,
            span_count: counts.spans,
            late_spans: counts.late_spans,
            evicted_traces: counts.evicted,
            queue_depth: self.queue.depth(),
            dropped_events: self.queue.dropped(),
            subscribers: self.hub.subscriber_count(),
            alert_rules: self.store.alert_rules().len(),
        }
    }

    /// Closes the queue, stops both tasks and disconnects every subscriber.
    pub fn shutdown(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.queue.close();
        for task in self.tasks().drain(..) {
            task.abort();
        }
        let disconnected = self.hub.disconnect_all(ErrorKind::TenantInactive);
        info!(tenant = %self.tenant, disconnected, "tenant pipeline stopped");
    }
}

impl Drop for TenantPipeline {
    fn drop(&mut self) {
        self.queue.close();
        for task in self.tasks().drain(..) {
            task.abort();
        }
    }
}

fn to_data<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|err| {
        warn!(error = %err, "failed to encode stream payload");
        serde_json::Value::Null
    })
}

async fn run_worker(
    tenant: TenantId,
    store: Store,
    queue: Arc<TenantQueue>,
    hub: Arc<SubscriptionHub>,
) {
    while let Some(event) = queue.pop().await {
        match event {
            IngestEvent::Span(span) => {
                let trace_id = span.trace_id.clone();
                if store.ingest_span(span, Utc::now()) == SpanOutcome::Late {
                    debug!(tenant = %tenant, trace_id = %trace_id, "late span for completed trace dropped");
                }
            }
            IngestEvent::Request(event) => {
                if !store.ingest_request(&event, Utc::now()) {
                    debug!(tenant = %tenant, timestamp = %event.timestamp, "request event outside metric window");
                }
                if hub.wants_topic(Topic::Metric) {
                    hub.publish(MessageType::Metric, to_data(&event));
                }
            }
        }
    }
    debug!(tenant = %tenant, "ingest worker exiting");
}

async fn run_scheduler(pipeline: Weak<TenantPipeline>, tick_every: Duration, heartbeat_every: Duration) {
    let start = tokio::time::Instant::now();
    let mut ticks = tokio::time::interval_at(start + tick_every, tick_every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut heartbeats = tokio::time::interval_at(start + heartbeat_every, heartbeat_every);
    heartbeats.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticks.tick() => {
                let Some(pipeline) = pipeline.upgrade() else { break };
                pipeline.tick(Utc::now()).await;
            }
            _ = heartbeats.tick() => {
                let Some(pipeline) = pipeline.upgrade() else { break };
                pipeline.heartbeat(Utc::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use tracepulse_core::model::alert::{AlertRule, Severity};
    use tracepulse_core::stream::Topic;
    use tracepulse_testkit::{base_time, sample_trace, uniform_requests};

    use super::*;

    fn config() -> Config {
        // long intervals keep the scheduler out of the way; tests tick by hand
        Config {
            tick_interval: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(7200),
            ..Config::default()
        }
    }

    fn start(cfg: Config) -> Arc<TenantPipeline> {
        TenantPipeline::start(TenantId::parse("acme").unwrap(), Arc::new(cfg))
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn worker_drains_queue_into_store() {
        let pipeline = start(config());
        for span in sample_trace("t1") {
            pipeline.ingest_span(span).unwrap();
        }
        let store = pipeline.store().clone();
        wait_until(|| store.trace_counts().spans == 3).await;
        assert_eq!(pipeline.status().active_traces, 1);
    }

    #[tokio::test]
    async fn tick_publishes_stats_and_alerts() {
        let cfg = Config {
            alert_rules: vec![AlertRule {
                name: "errors".into(),
                metric: "error_rate".into(),
                comparator: ">".into(),
                threshold: 0.05,
                severity: Severity::Critical,
                cooldown_seconds: 30,
                message: None,
            }],
            ..config()
        };
        let pipeline = start(cfg);
        let mut req = SubscribeRequest::default();
        req.topics.insert(Topic::Traces);
        let mut sub = pipeline.subscribe(&req).unwrap();
        assert_eq!(sub.receiver.recv().await.unwrap().kind, MessageType::Initial);

        let t0 = base_time();
        for event in uniform_requests(t0, ChronoDuration::seconds(10), 100, 10) {
            pipeline.ingest_request(event).unwrap();
        }
        let store = pipeline.store().clone();
        wait_until(|| store.current_stats(t0, 0).total_requests == 100).await;

        let report = pipeline.tick(t0 + ChronoDuration::seconds(10)).await;
        assert_eq!(report.stats.total_requests, 100);
        assert!((report.stats.error_rate - 0.1).abs() < 1e-9);
        assert_eq!(report.alerts.len(), 1);
        assert!(report.service_map_rebuilt);

        let mut kinds = Vec::new();
        while let Ok(envelope) = sub.receiver.try_recv() {
            kinds.push(envelope.kind);
        }
        assert_eq!(
            kinds,
            vec![
                MessageType::StatsUpdate,
                MessageType::Endpoints,
                MessageType::TimeSeries,
                MessageType::Alert,
            ]
        );

        // still breached, but inside the cooldown
        let again = pipeline.tick(t0 + ChronoDuration::seconds(11)).await;
        assert!(again.alerts.is_empty());
        assert!(!again.service_map_rebuilt);
    }

    #[tokio::test]
    async fn completed_traces_are_published() {
        let pipeline = start(config());
        let mut req = SubscribeRequest::default();
        req.topics = [Topic::Traces].into_iter().collect();
        let mut sub = pipeline.subscribe(&req).unwrap();
        sub.receiver.recv().await.unwrap();

        for span in sample_trace("t1") {
            pipeline.ingest_span(span).unwrap();
        }
        let store = pipeline.store().clone();
        wait_until(|| store.trace_counts().spans == 3).await;

        let report = pipeline.tick(Utc::now() + ChronoDuration::minutes(1)).await;
        assert_eq!(report.completed_traces, 1);
        let envelope = sub.receiver.recv().await.unwrap();
        assert_eq!(envelope.kind, MessageType::Trace);
        assert_eq!(envelope.data["trace_id"], "t1");
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_within_one_tick() {
        let pipeline = start(Config {
            subscriber_outbox: 2,
            ..config()
        });
        let slow = pipeline.subscribe(&SubscribeRequest::default()).unwrap();
        let report = pipeline.tick(base_time()).await;

        assert!(report.disconnected >= 1);
        assert_eq!(pipeline.hub().subscriber_count(), 0);
        assert_eq!(
            slow.disconnect_reason(),
            Some(ErrorKind::SubscriberBackpressure)
        );
    }

    #[tokio::test]
    async fn resync_flag_set_when_client_is_behind() {
        let pipeline = start(config());
        // frames only consume sequence numbers while someone is listening
        let _watcher = pipeline.subscribe(&SubscribeRequest::default()).unwrap();
        pipeline.heartbeat(Utc::now());

        let req = SubscribeRequest {
            last_seq: Some(0),
            ..SubscribeRequest::default()
        };
        let mut sub = pipeline.subscribe(&req).unwrap();
        let initial = sub.receiver.recv().await.unwrap();
        assert_eq!(initial.data["resync"], true);
        assert!(initial.data["contract"]["reconnect"].is_object());
    }

    #[tokio::test]
    async fn shutdown_rejects_ingest_and_disconnects() {
        let pipeline = start(config());
        let sub = pipeline.subscribe(&SubscribeRequest::default()).unwrap();
        pipeline.shutdown();

        let err = pipeline
            .ingest_request(tracepulse_testkit::request(base_time(), "/a", 200, 1.0))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TenantInactive);
        assert_eq!(sub.disconnect_reason(), Some(ErrorKind::TenantInactive));
        assert!(pipeline.subscribe(&SubscribeRequest::default()).is_err());
    }
}
