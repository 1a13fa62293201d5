use std::collections::{BTreeMap, HashMap};

use tracepulse_core::model::request::RequestEvent;

use crate::histogram::LatencyHistogram;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointCounter {
    pub count: u64,
    pub errors: u64,
    pub latency_sum_ms: f64,
}

/// One fixed-width aggregation bucket. `bucket` is the absolute bucket index
/// (`epoch_ms / width_ms`) whose events the slot currently holds.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricWindow {
    pub bucket: i64,
    pub count: u64,
    pub errors: u64,
    pub bytes: u64,
    pub latency_sum_ms: f64,
    pub histogram: LatencyHistogram,
    pub status_codes: BTreeMap<u16, u64>,
    pub endpoints: HashMap<String, EndpointCounter>,
}

impl MetricWindow {
    pub fn empty(bucket: i64) -> Self {
        Self {
            bucket,
            count: 0,
            errors: 0,
            bytes: 0,
            latency_sum_ms: 0.0,
            histogram: LatencyHistogram::default(),
            status_codes: BTreeMap::new(),
            endpoints: HashMap::new(),
        }
    }

    pub fn reset(&mut self, bucket: i64) {
        *self = Self::empty(bucket);
    }

    pub fn record(&mut self, event: &RequestEvent) {
        let error = event.is_error();
        self.count += 1;
        self.bytes += event.bytes_transferred;
        self.latency_sum_ms += event.response_time_ms;
        self.histogram.record(event.response_time_ms);
        *self.status_codes.entry(event.status_code).or_default() += 1;
        if error {
            self.errors += 1;
        }

        let endpoint = self.endpoints.entry(event.endpoint_key()).or_default();
        endpoint.count += 1;
        endpoint.latency_sum_ms += event.response_time_ms;
        if error {
            endpoint.errors += 1;
        }
    }
}
