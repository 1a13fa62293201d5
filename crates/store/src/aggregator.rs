use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracepulse_core::model::request::RequestEvent;
use tracepulse_core::model::stats::{
    EndpointStat, MetricKind, Stats, TimeSeries, TimeSeriesPoint,
};

use crate::histogram::LatencyHistogram;
use crate::window::{EndpointCounter, MetricWindow};

/// Buckets an event may run ahead of the ingest clock before it is dropped.
const MAX_FUTURE_BUCKETS: i64 = 1;

/// Ring buffer of `MetricWindow`s covering the most recent
/// `buckets * width`. Events older than the oldest retained bucket are
/// counted as late and dropped; nothing is back-filled. Events stamped
/// further ahead of the clock than `MAX_FUTURE_BUCKETS` are counted as
/// future and dropped so a skewed client cannot expire the window.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    width_ms: i64,
    slots: Vec<MetricWindow>,
    head: Option<i64>,
    late_events: u64,
    future_events: u64,
}

impl MetricsAggregator {
    pub fn new(width: Duration, buckets: usize) -> Self {
        let width_ms = (width.as_millis() as i64).max(1);
        let buckets = buckets.max(1);
        Self {
            width_ms,
            slots: (0..buckets).map(|_| MetricWindow::empty(i64::MIN)).collect(),
            head: None,
            late_events: 0,
            future_events: 0,
        }
    }

    fn bucket_of(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp_millis().div_euclid(self.width_ms)
    }

    fn len(&self) -> i64 {
        self.slots.len() as i64
    }

    fn oldest_bucket(&self, head: i64) -> i64 {
        head - self.len() + 1
    }

    pub fn late_events(&self) -> u64 {
        self.late_events
    }

    pub fn future_events(&self) -> u64 {
        self.future_events
    }

    pub fn window_seconds(&self) -> f64 {
        self.len() as f64 * self.width_ms as f64 / 1000.0
    }

    /// Routes `event` into the bucket containing its timestamp. Returns false
    /// when the event was too old or too far past `now` to keep.
    pub fn record(&mut self, event: &RequestEvent, now: DateTime<Utc>) -> bool {
        let bucket = self.bucket_of(event.timestamp);
        if bucket > self.bucket_of(now).saturating_add(MAX_FUTURE_BUCKETS) {
            self.future_events += 1;
            return false;
        }
        match self.head {
            Some(head) if bucket < self.oldest_bucket(head) => {
                self.late_events += 1;
                return false;
            }
            Some(head) if bucket <= head => {}
            _ => self.head = Some(bucket),
        }

        let idx = bucket.rem_euclid(self.len()) as usize;
        let slot = &mut self.slots[idx];
        if slot.bucket != bucket {
            slot.reset(bucket);
        }
        slot.record(event);
        true
    }

    /// Advances the head to the bucket containing `now`. Buckets that fall
    /// out of the window stop counting immediately and are cleared on reuse.
    pub fn rotate(&mut self, now: DateTime<Utc>) {
        let bucket = self.bucket_of(now);
        if self.head.is_none_or(|head| bucket > head) {
            self.head = Some(bucket);
        }
    }

    fn active_slots(&self) -> impl Iterator<Item = &MetricWindow> {
        let range = self
            .head
            .map(|head| (self.oldest_bucket(head), head));
        self.slots.iter().filter(move |slot| {
            range.is_some_and(|(lo, hi)| slot.bucket >= lo && slot.bucket <= hi)
        })
    }

    pub fn current_stats(&self, generated_at: DateTime<Utc>, dropped_events: u64) -> Stats {
        summarize(
            self.active_slots(),
            self.window_seconds(),
            generated_at,
            dropped_events,
            self.late_events,
            self.future_events,
        )
    }

    /// Endpoints ranked by request count, ties broken by name ascending.
    pub fn top_n_endpoints(&self, n: usize) -> Vec<EndpointStat> {
        let mut merged: HashMap<&str, EndpointCounter> = HashMap::new();
        for slot in self.active_slots() {
            for (name, counter) in &slot.endpoints {
                let entry = merged.entry(name.as_str()).or_default();
                entry.count += counter.count;
                entry.errors += counter.errors;
                entry.latency_sum_ms += counter.latency_sum_ms;
            }
        }

        let mut ranked = merged
            .into_iter()
            .map(|(name, c)| EndpointStat {
                endpoint: name.to_string(),
                count: c.count,
                error_count: c.errors,
                error_rate: ratio(c.errors as f64, c.count),
                avg_latency_ms: ratio(c.latency_sum_ms, c.count),
            })
            .collect::<Vec<_>>();
        ranked.sort_by(|a, b| {
            Reverse(a.count)
                .cmp(&Reverse(b.count))
                .then_with(|| a.endpoint.cmp(&b.endpoint))
        });
        ranked.truncate(n);
        ranked
    }

    /// One point per bucket of the window, oldest first. Empty buckets
    /// report zero.
    pub fn time_series(&self, metric: MetricKind, dropped_events: u64) -> TimeSeries {
        let bucket_seconds = self.width_ms as f64 / 1000.0;
        let Some(head) = self.head else {
            return TimeSeries {
                metric,
                bucket_seconds,
                points: Vec::new(),
            };
        };

        let points = (self.oldest_bucket(head)..=head)
            .map(|bucket| {
                let idx = bucket.rem_euclid(self.len()) as usize;
                let slot = &self.slots[idx];
                let slots = (slot.bucket == bucket).then_some(slot);
                let timestamp = DateTime::from_timestamp_millis(bucket * self.width_ms)
                    .unwrap_or_default();
                let stats = summarize(
                    slots.into_iter(),
                    bucket_seconds,
                    timestamp,
                    dropped_events,
                    self.late_events,
                    self.future_events,
                );
                TimeSeriesPoint {
                    timestamp,
                    value: metric.value_of(&stats),
                }
            })
            .collect();

        TimeSeries {
            metric,
            bucket_seconds,
            points,
        }
    }
}

fn ratio(numerator: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        numerator / count as f64
    }
}

fn summarize<'a>(
    slots: impl Iterator<Item = &'a MetricWindow>,
    window_seconds: f64,
    generated_at: DateTime<Utc>,
    dropped_events: u64,
    late_events: u64,
    future_events: u64,
) -> Stats {
    let mut total = 0u64;
    let mut errors = 0u64;
    let mut bytes = 0u64;
    let mut latency_sum = 0.0;
    let mut histogram = LatencyHistogram::default();
    let mut status_codes: BTreeMap<u16, u64> = BTreeMap::new();

    for slot in slots {
        total += slot.count;
        errors += slot.errors;
        bytes += slot.bytes;
        latency_sum += slot.latency_sum_ms;
        histogram.merge(&slot.histogram);
        for (code, count) in &slot.status_codes {
            *status_codes.entry(*code).or_default() += count;
        }
    }

    let per_second = |v: f64| {
        if window_seconds > 0.0 {
            v / window_seconds
        } else {
            0.0
        }
    };

    Stats {
        generated_at,
        window_seconds,
        total_requests: total,
        requests_per_second: per_second(total as f64),
        error_count: errors,
        error_rate: ratio(errors as f64, total),
        avg_latency_ms: ratio(latency_sum, total),
        p50_latency_ms: histogram.percentile(0.50),
        p95_latency_ms: histogram.percentile(0.95),
        p99_latency_ms: histogram.percentile(0.99),
        bytes_transferred: bytes,
        bandwidth_bytes_per_second: per_second(bytes as f64),
        status_codes,
        dropped_events,
        late_events,
        future_events,
    }
}
