use std::str::FromStr;

use chrono::{DateTime, Utc};
use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TracepulseError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    TsAsc,
    #[default]
    TsDesc,
    DurationDesc,
}

impl FromStr for SortOrder {
    type Err = TracepulseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ts_asc" => Ok(Self::TsAsc),
            "ts_desc" => Ok(Self::TsDesc),
            "duration_desc" => Ok(Self::DurationDesc),
            other => Err(TracepulseError::Parse(format!("unknown sort order: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimeWindow {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        if let Some(since) = self.since
            && ts < since
        {
            return false;
        }
        if let Some(until) = self.until
            && ts > until
        {
            return false;
        }
        true
    }
}

/// Name filter that accepts either an exact value or a glob (`api-*`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NameFilter {
    pub glob: String,
}

impl NameFilter {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(TracepulseError::Parse("empty name filter".into()));
        }
        Pattern::new(trimmed)
            .map_err(|e| TracepulseError::Parse(format!("invalid name filter {trimmed}: {e}")))?;
        Ok(Self {
            glob: trimmed.to_string(),
        })
    }

    pub fn matches(&self, value: &str) -> bool {
        value == self.glob
            || Pattern::new(&self.glob)
                .map(|p| p.matches(value))
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceFilter {
    pub service: Option<NameFilter>,
    pub operation: Option<NameFilter>,
    pub min_duration_ms: Option<f64>,
    pub max_duration_ms: Option<f64>,
    pub error_only: bool,
    pub window: TimeWindow,
    pub sort: SortOrder,
    pub limit: usize,
}

impl Default for TraceFilter {
    fn default() -> Self {
        Self {
            service: None,
            operation: None,
            min_duration_ms: None,
            max_duration_ms: None,
            error_only: false,
            window: TimeWindow::all(),
            sort: SortOrder::TsDesc,
            limit: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn sort_parse() {
        assert_eq!(SortOrder::from_str("duration_desc").unwrap(), SortOrder::DurationDesc);
        assert!(SortOrder::from_str("wat").is_err());
    }

    #[test]
    fn name_filter_exact_and_glob() {
        let f = NameFilter::parse("payments-*").unwrap();
        assert!(f.matches("payments-api"));
        assert!(!f.matches("auth"));
        assert!(NameFilter::parse("svc[").is_err());
        assert!(NameFilter::parse("checkout").unwrap().matches("checkout"));
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let t0 = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let window = TimeWindow {
            since: Some(t0),
            until: Some(t0 + chrono::Duration::seconds(10)),
        };
        assert!(window.contains(t0));
        assert!(window.contains(t0 + chrono::Duration::seconds(10)));
        assert!(!window.contains(t0 - chrono::Duration::seconds(1)));
    }
}
