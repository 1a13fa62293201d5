use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error categories surfaced to clients. The string form is part of
/// the wire contract, so variants must never be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidSpan,
    MissingIdentifier,
    InvalidRequestEvent,
    TenantInactive,
    QueueOverflow,
    SubscriberBackpressure,
    TraceNotFound,
    InvalidRule,
    InvalidArgument,
    Config,
    Parse,
    Io,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidSpan => "InvalidSpan",
            Self::MissingIdentifier => "MissingIdentifier",
            Self::InvalidRequestEvent => "InvalidRequestEvent",
            Self::TenantInactive => "TenantInactive",
            Self::QueueOverflow => "QueueOverflow",
            Self::SubscriberBackpressure => "SubscriberBackpressure",
            Self::TraceNotFound => "TraceNotFound",
            Self::InvalidRule => "InvalidRule",
            Self::InvalidArgument => "InvalidArgument",
            Self::Config => "Config",
            Self::Parse => "Parse",
            Self::Io => "Io",
            Self::Internal => "Internal",
        }
    }

    /// Errors the caller caused and can fix by changing the request.
    pub fn is_client_error(self) -> bool {
        matches!(
            self,
            Self::InvalidSpan
                | Self::MissingIdentifier
                | Self::InvalidRequestEvent
                | Self::InvalidArgument
                | Self::InvalidRule
                | Self::Parse
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TracepulseError {
    #[error("invalid span: {0}")]
    InvalidSpan(String),

    #[error("missing identifier: {0}")]
    MissingIdentifier(String),

    #[error("invalid request event: {0}")]
    InvalidRequestEvent(String),

    #[error("tenant inactive: {0}")]
    TenantInactive(String),

    #[error("queue overflow: {0}")]
    QueueOverflow(String),

    #[error("subscriber backpressure: {0}")]
    SubscriberBackpressure(String),

    #[error("trace not found: {0}")]
    TraceNotFound(String),

    #[error("invalid alert rule: {0}")]
    InvalidRule(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TracepulseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSpan(_) => ErrorKind::InvalidSpan,
            Self::MissingIdentifier(_) => ErrorKind::MissingIdentifier,
            Self::InvalidRequestEvent(_) => ErrorKind::InvalidRequestEvent,
            Self::TenantInactive(_) => ErrorKind::TenantInactive,
            Self::QueueOverflow(_) => ErrorKind::QueueOverflow,
            Self::SubscriberBackpressure(_) => ErrorKind::SubscriberBackpressure,
            Self::TraceNotFound(_) => ErrorKind::TraceNotFound,
            Self::InvalidRule(_) => ErrorKind::InvalidRule,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Config(_) => ErrorKind::Config,
            Self::Parse(_) => ErrorKind::Parse,
            Self::Io(_) => ErrorKind::Io,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, TracepulseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        let err = TracepulseError::MissingIdentifier("trace_id".into());
        assert_eq!(err.kind().as_str(), "MissingIdentifier");
        assert_eq!(
            serde_json::to_string(&ErrorKind::TenantInactive).unwrap(),
            "\"TenantInactive\""
        );
    }

    #[test]
    fn client_errors_are_classified() {
        assert!(ErrorKind::InvalidSpan.is_client_error());
        assert!(!ErrorKind::TenantInactive.is_client_error());
        assert!(!ErrorKind::Internal.is_client_error());
    }
}
