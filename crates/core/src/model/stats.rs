use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TracepulseError};

/// Aggregate view of the active metric window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stats {
    pub generated_at: DateTime<Utc>,
    pub window_seconds: f64,
    pub total_requests: u64,
    pub requests_per_second: f64,
    pub error_count: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub bytes_transferred: u64,
    pub bandwidth_bytes_per_second: f64,
    pub status_codes: BTreeMap<u16, u64>,
    /// Events discarded by the ingest queue since the tenant was activated.
    pub dropped_events: u64,
    /// Events older than the window that were not back-filled.
    pub late_events: u64,
    /// Events stamped too far ahead of the ingest clock.
    #[serde(default)]
    pub future_events: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointStat {
    pub endpoint: String,
    pub count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeSeries {
    pub metric: MetricKind,
    pub bucket_seconds: f64,
    pub points: Vec<TimeSeriesPoint>,
}

/// Named metrics that alert rules and time series can refer to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Rps,
    AvgLatency,
    P50Latency,
    P95Latency,
    P99Latency,
    ErrorRate,
    Bandwidth,
    DroppedEvents,
}

impl MetricKind {
    pub const ALL: [MetricKind; 8] = [
        Self::Rps,
        Self::AvgLatency,
        Self::P50Latency,
        Self::P95Latency,
        Self::P99Latency,
        Self::ErrorRate,
        Self::Bandwidth,
        Self::DroppedEvents,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rps => "rps",
            Self::AvgLatency => "avg_latency",
            Self::P50Latency => "p50_latency",
            Self::P95Latency => "p95_latency",
            Self::P99Latency => "p99_latency",
            Self::ErrorRate => "error_rate",
            Self::Bandwidth => "bandwidth",
            Self::DroppedEvents => "dropped_events",
        }
    }

    pub fn value_of(self, stats: &Stats) -> f64 {
        match self {
            Self::Rps => stats.requests_per_second,
            Self::AvgLatency => stats.avg_latency_ms,
            Self::P50Latency => stats.p50_latency_ms,
            Self::P95Latency => stats.p95_latency_ms,
            Self::P99Latency => stats.p99_latency_ms,
            Self::ErrorRate => stats.error_rate,
            Self::Bandwidth => stats.bandwidth_bytes_per_second,
            Self::DroppedEvents => stats.dropped_events as f64,
        }
    }
}

impl FromStr for MetricKind {
    type Err = TracepulseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rps" | "requests_per_second" => Ok(Self::Rps),
            "avg_latency" | "latency" => Ok(Self::AvgLatency),
            "p50_latency" | "p50" => Ok(Self::P50Latency),
            "p95_latency" | "p95" => Ok(Self::P95Latency),
            "p99_latency" | "p99" => Ok(Self::P99Latency),
            "error_rate" => Ok(Self::ErrorRate),
            "bandwidth" => Ok(Self::Bandwidth),
            "dropped_events" => Ok(Self::DroppedEvents),
            _ => Err(TracepulseError::Parse(format!("unknown metric: {s}"))),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
