use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracepulse_core::ErrorKind;
use tracepulse_core::error::{Result, TracepulseError};
use tracepulse_core::ids::TenantId;

pub const TENANT_HEADER: &str = "x-tenant-id";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

/// HTTP face of `TracepulseError`: `{"error": {"kind", "message"}}`.
#[derive(Debug)]
pub struct ApiError(pub TracepulseError);

impl From<TracepulseError> for ApiError {
    fn from(err: TracepulseError) -> Self {
        Self(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::TraceNotFound => StatusCode::NOT_FOUND,
        ErrorKind::TenantInactive => StatusCode::CONFLICT,
        kind if kind.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            tracing::error!(kind = kind.as_str(), error = %self.0, "request failed");
        } else {
            tracing::debug!(kind = kind.as_str(), error = %self.0, "request rejected");
        }
        let body = ErrorEnvelope {
            error: ErrorBody {
                kind: kind.as_str().to_string(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Tenant named by the `x-tenant-id` header, if the header is present.
pub fn tenant_header(headers: &HeaderMap) -> Result<Option<TenantId>> {
    match headers.get(TENANT_HEADER) {
        None => Ok(None),
        Some(value) => {
            let raw = value.to_str().map_err(|_| {
                TracepulseError::MissingIdentifier(format!("{TENANT_HEADER} is not valid text"))
            })?;
            TenantId::parse(raw).map(Some)
        }
    }
}

/// Tenant from the header, falling back to `fallback` (query string or
/// payload). Neither present is a `MissingIdentifier` error.
pub fn require_tenant(headers: &HeaderMap, fallback: Option<&str>) -> Result<TenantId> {
    if let Some(tenant) = tenant_header(headers)? {
        return Ok(tenant);
    }
    TenantId::parse_opt(fallback).map_err(|_| {
        TracepulseError::MissingIdentifier(format!(
            "tenant is required ({TENANT_HEADER} header or tenant parameter)"
        ))
    })
}
