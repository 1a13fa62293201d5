use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TracepulseError};
use crate::model::stats::MetricKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Comparator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }

    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Gte => value >= threshold,
            Self::Lt => value < threshold,
            Self::Lte => value <= threshold,
            Self::Eq => (value - threshold).abs() < f64::EPSILON,
            Self::Ne => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

impl FromStr for Comparator {
    type Err = TracepulseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            ">" | "gt" => Ok(Self::Gt),
            ">=" | "gte" => Ok(Self::Gte),
            "<" | "lt" => Ok(Self::Lt),
            "<=" | "lte" => Ok(Self::Lte),
            "==" | "=" | "eq" => Ok(Self::Eq),
            "!=" | "ne" => Ok(Self::Ne),
            other => Err(TracepulseError::Parse(format!("unknown comparator: {other}"))),
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A threshold rule as configured. `metric` and `comparator` stay as text so a
/// misconfigured rule can still be loaded, reported and later corrected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRule {
    pub name: String,
    pub metric: String,
    pub comparator: String,
    pub threshold: f64,
    pub severity: Severity,
    #[serde(default)]
    pub cooldown_seconds: u64,
    #[serde(default)]
    pub message: Option<String>,
}

impl AlertRule {
    pub fn resolve(&self) -> Result<(MetricKind, Comparator)> {
        let metric = self.metric.parse::<MetricKind>().map_err(|e| {
            TracepulseError::InvalidRule(format!("rule {}: {e}", self.name))
        })?;
        let comparator = self.comparator.parse::<Comparator>().map_err(|e| {
            TracepulseError::InvalidRule(format!("rule {}: {e}", self.name))
        })?;
        if !self.threshold.is_finite() {
            return Err(TracepulseError::InvalidRule(format!(
                "rule {}: threshold must be finite",
                self.name
            )));
        }
        Ok((metric, comparator))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: String,
    pub rule: String,
    pub metric: MetricKind,
    pub comparator: Comparator,
    pub threshold: f64,
    pub value: f64,
    pub severity: Severity,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RulePhase {
    Armed,
    Firing { since: DateTime<Utc> },
    Cooldown { until: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleStatus {
    pub rule: AlertRule,
    pub phase: RulePhase,
    pub last_value: Option<f64>,
    pub last_error: Option<String>,
    pub fired_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparators_parse_and_hold() {
        assert!(Comparator::from_str(">").unwrap().holds(0.2, 0.1));
        assert!(!Comparator::from_str(">=").unwrap().holds(0.05, 0.1));
        assert!(Comparator::from_str("<").unwrap().holds(1.0, 2.0));
        assert!(Comparator::from_str("~").is_err());
    }

    #[test]
    fn resolve_reports_bad_metric_as_invalid_rule() {
        let rule = AlertRule {
            name: "cpu".into(),
            metric: "cpu_usage".into(),
            comparator: ">".into(),
            threshold: 1.0,
            severity: Severity::High,
            cooldown_seconds: 0,
            message: None,
        };
        let err = rule.resolve().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRule);
    }

    #[test]
    fn rule_deserializes_from_toml() {
        let rule: AlertRule = toml::from_str(
            r#"
            name = "errors"
            metric = "error_rate"
            comparator = ">"
            threshold = 0.1
            severity = "critical"
            cooldown_seconds = 30
            "#,
        )
        .unwrap();
        assert_eq!(rule.severity, Severity::Critical);
        assert_eq!(
            rule.resolve().unwrap(),
            (MetricKind::ErrorRate, Comparator::Gt)
        );
    }
}
