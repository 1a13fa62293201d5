use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TracepulseError};

const MAX_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanId(String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

fn parse_id(input: Option<&str>, what: &str) -> Result<String> {
    let trimmed = input.map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return Err(TracepulseError::MissingIdentifier(format!("{what} is required")));
    }
    if trimmed.len() > MAX_ID_LEN || trimmed.chars().any(|c| c.is_control()) {
        return Err(TracepulseError::MissingIdentifier(format!(
            "{what} is not a usable identifier: {trimmed:?}"
        )));
    }
    Ok(trimmed.to_string())
}

macro_rules! id_impls {
    ($ty:ident, $what:literal) => {
        impl $ty {
            /// Validates an optional raw identifier; absent, blank or
            /// unprintable input is a `MissingIdentifier` error.
            pub fn parse_opt(input: Option<&str>) -> Result<Self> {
                parse_id(input, $what).map(Self)
            }

            pub fn parse(input: &str) -> Result<Self> {
                Self::parse_opt(Some(input))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Borrow<str> for $ty {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

id_impls!(TraceId, "trace_id");
id_impls!(SpanId, "span_id");
id_impls!(TenantId, "tenant_id");

pub const SYNTHETIC_ROOT_ID: &str = "<synthetic-root>";

impl SpanId {
    /// Placeholder parent that orphaned spans are hung under in a hierarchy.
    pub fn synthetic_root() -> Self {
        Self(SYNTHETIC_ROOT_ID.to_string())
    }
}
