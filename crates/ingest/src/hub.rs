use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracepulse_core::ErrorKind;
use tracepulse_core::ids::TenantId;
use tracepulse_core::model::stats::MetricKind;
use tracepulse_core::stream::{Envelope, MessageType, SubscribeRequest, Topic};
use tracing::{debug, warn};

struct SubscriberEntry {
    topics: BTreeSet<Topic>,
    series: MetricKind,
    tx: mpsc::Sender<Envelope>,
    last_acked: Option<u64>,
    reason: Arc<OnceLock<ErrorKind>>,
}

impl SubscriberEntry {
    fn wants(&self, kind: MessageType) -> bool {
        kind.topic().is_none_or(|topic| self.topics.contains(&topic))
    }
}

/// Receiving side handed to a transport. The channel closes when the hub
/// drops the subscriber; `disconnect_reason` tells why.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<Envelope>,
    reason: Arc<OnceLock<ErrorKind>>,
}

impl Subscription {
    pub fn disconnect_reason(&self) -> Option<ErrorKind> {
        self.reason.get().copied()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub seq: u64,
    pub delivered: usize,
    pub disconnected: usize,
    pub pruned: usize,
}

/// Per-tenant fan-out of envelopes to subscriber outboxes. Publishing never
/// waits on a subscriber.
pub struct SubscriptionHub {
    tenant: TenantId,
    outbox_capacity: usize,
    seq: AtomicU64,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, SubscriberEntry>>,
}

impl SubscriptionHub {
    pub fn new(tenant: TenantId, outbox_capacity: usize) -> Self {
        Self {
            tenant,
            outbox_capacity: outbox_capacity.max(1),
            seq: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, SubscriberEntry>> {
        self.subscribers.lock().expect("subscriber registry poisoned")
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last sequence number handed out for this tenant.
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Registers a subscriber whose outbox starts with the `initial` snapshot.
    pub fn subscribe(&self, req: &SubscribeRequest, initial: serde_json::Value) -> Subscription {
        let (tx, receiver) = mpsc::channel(self.outbox_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reason = Arc::new(OnceLock::new());

        // Holding the registry lock keeps any publish from overtaking the
        // initial frame.
        let mut subscribers = self.subscribers();
        let initial = Envelope {
            kind: MessageType::Initial,
            seq: self.next_seq(),
            data: initial,
        };
        if tx.try_send(initial).is_err() {
            warn!(tenant = %self.tenant, subscriber = id, "initial snapshot could not be queued");
        }
        subscribers.insert(
            id,
            SubscriberEntry {
                topics: req.topics.clone(),
                series: req.series,
                tx,
                last_acked: None,
                reason: reason.clone(),
            },
        );
        debug!(
            tenant = %self.tenant,
            subscriber = id,
            topics = ?req.topics,
            "subscriber registered"
        );

        Subscription {
            id,
            receiver,
            reason,
        }
    }

    pub fn publish(&self, kind: MessageType, data: serde_json::Value) -> PublishReport {
        self.fan_out(kind, data, |entry| entry.wants(kind))
    }

    /// Time series frames go only to subscribers following `series`.
    pub fn publish_series(&self, series: MetricKind, data: serde_json::Value) -> PublishReport {
        self.fan_out(MessageType::TimeSeries, data, |entry| {
            entry.series == series && entry.wants(MessageType::TimeSeries)
        })
    }

    pub fn heartbeat(&self, now: DateTime<Utc>) -> PublishReport {
        self.publish(
            MessageType::Heartbeat,
            serde_json::json!({ "timestamp": now }),
        )
    }

    fn fan_out(
        &self,
        kind: MessageType,
        data: serde_json::Value,
        wanted: impl Fn(&SubscriberEntry) -> bool,
    ) -> PublishReport {
        let mut subscribers = self.subscribers();
        let mut report = PublishReport::default();
        if !subscribers.values().any(&wanted) {
            return report;
        }

        let envelope = Envelope {
            kind,
            seq: self.next_seq(),
            data,
        };
        report.seq = envelope.seq;

        subscribers.retain(|id, entry| {
            if !wanted(entry) {
                return true;
            }
            match entry.tx.try_send(envelope.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    let _ = entry.reason.set(ErrorKind::SubscriberBackpressure);
                    report.disconnected += 1;
                    warn!(
                        tenant = %self.tenant,
                        subscriber = id,
                        seq = envelope.seq,
                        "subscriber outbox full; disconnecting"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    report.pruned += 1;
                    debug!(tenant = %self.tenant, subscriber = id, "pruned closed subscriber");
                    false
                }
            }
        });
        report
    }

    /// Series currently requested by time-series subscribers.
    pub fn series_wanted(&self) -> BTreeSet<MetricKind> {
        self.subscribers()
            .values()
            .filter(|entry| entry.topics.contains(&Topic::TimeSeries))
            .map(|entry| entry.series)
            .collect()
    }

    pub fn wants_topic(&self, topic: Topic) -> bool {
        self.subscribers()
            .values()
            .any(|entry| entry.topics.contains(&topic))
    }

    pub fn ack(&self, id: u64, seq: u64) {
        if let Some(entry) = self.subscribers().get_mut(&id) {
            entry.last_acked = Some(entry.last_acked.map_or(seq, |prev| prev.max(seq)));
        }
    }

    pub fn last_acked(&self, id: u64) -> Option<u64> {
        self.subscribers().get(&id).and_then(|entry| entry.last_acked)
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers().remove(&id).is_some() {
            debug!(tenant = %self.tenant, subscriber = id, "subscriber left");
        }
    }

    pub fn disconnect_all(&self, reason: ErrorKind) -> usize {
        let mut subscribers = self.subscribers();
        for entry in subscribers.values() {
            let _ = entry.reason.set(reason);
        }
        let count = subscribers.len();
        subscribers.clear();
        count
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}
