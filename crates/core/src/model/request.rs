use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TracepulseError};

/// One completed request observed by an instrumented service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestEvent {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub response_time_ms: f64,
    pub bytes_transferred: u64,
}

impl RequestEvent {
    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }

    /// `"{METHOD} {templated path}"`, the key endpoints are ranked by.
    pub fn endpoint_key(&self) -> String {
        format!("{} {}", self.method, template_path(&self.path))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestEventPayload {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default, alias = "endpoint", alias = "url")]
    pub path: Option<String>,
    #[serde(default, alias = "statusCode", alias = "status")]
    pub status_code: Option<i64>,
    #[serde(default, alias = "responseTime", alias = "response_time")]
    pub response_time_ms: Option<f64>,
    #[serde(default, alias = "bytesTransferred", alias = "bytes")]
    pub bytes_transferred: Option<u64>,
}

impl RequestEventPayload {
    /// Validates the payload. Events without a timestamp are stamped with
    /// `received_at`.
    pub fn into_event(self, received_at: DateTime<Utc>) -> Result<RequestEvent> {
        let method = self
            .method
            .map(|m| m.trim().to_ascii_uppercase())
            .filter(|m| !m.is_empty())
            .ok_or_else(|| TracepulseError::InvalidRequestEvent("method is required".into()))?;
        let path = self
            .path
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| TracepulseError::InvalidRequestEvent("path is required".into()))?;

        let status_code = match self.status_code {
            Some(code @ 100..=599) => code as u16,
            Some(code) => {
                return Err(TracepulseError::InvalidRequestEvent(format!(
                    "status_code {code} is outside 100..=599"
                )));
            }
            None => {
                return Err(TracepulseError::InvalidRequestEvent(
                    "status_code is required".into(),
                ));
            }
        };

        let response_time_ms = self.response_time_ms.unwrap_or(0.0);
        if !response_time_ms.is_finite() || response_time_ms < 0.0 {
            return Err(TracepulseError::InvalidRequestEvent(format!(
                "response_time_ms {response_time_ms} must be a non-negative number"
            )));
        }

        Ok(RequestEvent {
            timestamp: self.timestamp.unwrap_or(received_at),
            method,
            path,
            status_code,
            response_time_ms,
            bytes_transferred: self.bytes_transferred.unwrap_or(0),
        })
    }
}

/// Collapses identifier-like path segments (numbers, UUIDs, long hex) into
/// `:id` and strips the query string, so `/users/42?x=1` and `/users/7` share
/// one endpoint.
pub fn template_path(path: &str) -> String {
    static ID_SEGMENT: OnceLock<Regex> = OnceLock::new();
    let re = ID_SEGMENT.get_or_init(|| {
        Regex::new(
            r"^(?:\d+|[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}|[0-9a-fA-F]{16,})$",
        )
        .expect("id segment regex is valid")
    });

    let path = path.split(['?', '#']).next().unwrap_or_default();
    let templated = path
        .split('/')
        .map(|segment| if re.is_match(segment) { ":id" } else { segment })
        .collect::<Vec<_>>()
        .join("/");
    if templated.is_empty() {
        "/".to_string()
    } else {
        templated
    }
}
