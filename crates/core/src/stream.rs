use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{Config, ReconnectPolicy};
use crate::error::{Result, TracepulseError};
use crate::model::stats::MetricKind;

/// Topics a subscriber can register interest in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Stats,
    Endpoints,
    TimeSeries,
    Alerts,
    Traces,
    Metric,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Self::Stats,
        Self::Endpoints,
        Self::TimeSeries,
        Self::Alerts,
        Self::Traces,
        Self::Metric,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stats => "stats",
            Self::Endpoints => "endpoints",
            Self::TimeSeries => "time_series",
            Self::Alerts => "alerts",
            Self::Traces => "traces",
            Self::Metric => "metric",
        }
    }

    /// Topics assumed when a client subscribes without naming any. The raw
    /// per-event `metric` feed is opt-in.
    pub fn defaults() -> BTreeSet<Topic> {
        [Self::Stats, Self::Endpoints, Self::TimeSeries, Self::Alerts]
            .into_iter()
            .collect()
    }
}

impl FromStr for Topic {
    type Err = TracepulseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "stats" => Ok(Self::Stats),
            "endpoints" => Ok(Self::Endpoints),
            "time_series" | "timeseries" => Ok(Self::TimeSeries),
            "alerts" => Ok(Self::Alerts),
            "traces" | "trace" => Ok(Self::Traces),
            "metric" | "metrics" => Ok(Self::Metric),
            other => Err(TracepulseError::InvalidArgument(format!(
                "unknown topic: {other}"
            ))),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Initial,
    StatsUpdate,
    Metric,
    Alert,
    TimeSeries,
    Endpoints,
    Heartbeat,
    Trace,
}

impl MessageType {
    /// Topic gating delivery; `None` means every subscriber receives it.
    pub fn topic(self) -> Option<Topic> {
        match self {
            Self::Initial | Self::Heartbeat => None,
            Self::StatsUpdate => Some(Topic::Stats),
            Self::Metric => Some(Topic::Metric),
            Self::Alert => Some(Topic::Alerts),
            Self::TimeSeries => Some(Topic::TimeSeries),
            Self::Endpoints => Some(Topic::Endpoints),
            Self::Trace => Some(Topic::Traces),
        }
    }
}

/// One server-pushed frame. `seq` is per tenant and strictly increasing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub seq: u64,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| TracepulseError::Internal(format!("envelope encode failed: {e}")))
    }
}

/// Frames a client may send after connecting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(default)]
        topics: Vec<String>,
        #[serde(default)]
        last_seq: Option<u64>,
        #[serde(default)]
        series: Option<String>,
    },
    Ack {
        seq: u64,
    },
    Ping,
}

/// Parsed subscription request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    pub topics: BTreeSet<Topic>,
    pub last_seq: Option<u64>,
    pub series: MetricKind,
}

impl SubscribeRequest {
    pub fn parse(topics: &[String], last_seq: Option<u64>, series: Option<&str>) -> Result<Self> {
        let topics = if topics.is_empty() {
            Topic::defaults()
        } else {
            topics
                .iter()
                .map(|t| t.parse::<Topic>())
                .collect::<Result<BTreeSet<_>>>()?
        };
        let series = match series {
            Some(raw) => raw
                .parse::<MetricKind>()
                .map_err(|e| TracepulseError::InvalidArgument(e.to_string()))?,
            None => MetricKind::Rps,
        };
        Ok(Self {
            topics,
            last_seq,
            series,
        })
    }
}

impl Default for SubscribeRequest {
    fn default() -> Self {
        Self {
            topics: Topic::defaults(),
            last_seq: None,
            series: MetricKind::Rps,
        }
    }
}

/// How long the server waits for a `subscribe` frame before falling back to
/// the default subscription.
pub const SUBSCRIBE_TIMEOUT_MS: u64 = 2_000;

/// Connection parameters the server documents to streaming clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamContract {
    pub heartbeat_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub subscribe_timeout_ms: u64,
    pub outbox_capacity: usize,
    pub reconnect: ReconnectPolicy,
    pub topics: Vec<Topic>,
}

impl StreamContract {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            heartbeat_interval_ms: cfg.heartbeat_interval.as_millis() as u64,
            idle_timeout_ms: cfg.idle_timeout.as_millis() as u64,
            subscribe_timeout_ms: SUBSCRIBE_TIMEOUT_MS,
            outbox_capacity: cfg.subscriber_outbox,
            reconnect: cfg.reconnect.clone(),
            topics: Topic::ALL.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_type_field() {
        let env = Envelope {
            kind: MessageType::StatsUpdate,
            seq: 7,
            data: serde_json::json!({"total_requests": 1}),
        };
        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "stats_update");
        assert_eq!(json["seq"], 7);
    }

    #[test]
    fn subscribe_message_parses() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","topics":["stats","alerts"],"last_seq":12,"series":"p95"}"#,
        )
        .unwrap();
        let ClientMessage::Subscribe {
            topics,
            last_seq,
            series,
        } = msg
        else {
            panic!("expected subscribe");
        };
        let req = SubscribeRequest::parse(&topics, last_seq, series.as_deref()).unwrap();
        assert!(req.topics.contains(&Topic::Alerts));
        assert!(!req.topics.contains(&Topic::Metric));
        assert_eq!(req.series, MetricKind::P95Latency);
        assert_eq!(req.last_seq, Some(12));
    }

    #[test]
    fn empty_topics_use_defaults_and_unknown_topics_fail() {
        let req = SubscribeRequest::parse(&[], None, None).unwrap();
        assert_eq!(req.topics, Topic::defaults());
        assert!(SubscribeRequest::parse(&["weather".into()], None, None).is_err());
    }

    #[test]
    fn heartbeat_and_initial_bypass_topics() {
        assert_eq!(MessageType::Heartbeat.topic(), None);
        assert_eq!(MessageType::Alert.topic(), Some(Topic::Alerts));
    }
}
