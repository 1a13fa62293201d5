use chrono::{DateTime, Utc};

use crate::error::{Result, TracepulseError};
use crate::filter::TimeWindow;

pub fn parse_time_or_relative(input: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }

    if let Ok(duration) = humantime::parse_duration(input) {
        return Ok(Utc::now()
            - chrono::Duration::from_std(duration).map_err(|e| {
                TracepulseError::Parse(format!("failed to parse duration to chrono: {e}"))
            })?);
    }

    Err(TracepulseError::Parse(format!(
        "expected RFC3339 time or duration, got {input}"
    )))
}

/// Parses the `time_range` query form: either a lookback (`15m`) or an
/// explicit `start..end` pair where either side may be empty.
pub fn parse_time_range(input: &str) -> Result<TimeWindow> {
    let input = input.trim();
    if let Some((since, until)) = input.split_once("..") {
        let since = (!since.is_empty())
            .then(|| parse_time_or_relative(since))
            .transpose()?;
        let until = (!until.is_empty())
            .then(|| parse_time_or_relative(until))
            .transpose()?;
        return Ok(TimeWindow { since, until });
    }
    Ok(TimeWindow {
        since: Some(parse_time_or_relative(input)?),
        until: None,
    })
}
