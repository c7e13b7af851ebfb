//! Gateway error taxonomy.
//!
//! Every failure surfaced to a caller maps to one of these kinds. Transport
//! failures are distinct variants from domain rejections so retry policy can
//! be decided by matching, never by string inspection.

use axum::http::StatusCode;
use serde::Serialize;

use crate::risk::RiskReason;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Request schema or canonical-ID parse failure.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Pre-trade risk denied the order. Never retried.
    #[error("risk denied: {reason}")]
    RiskDenied { reason: RiskReason },

    /// No eligible venue for a routable instrument.
    #[error("no eligible venue: {0}")]
    RouteUnavailable(String),

    /// Transport failure after all submit retries.
    #[error("venue {venue} unreachable: {detail}")]
    VenueUnreachable { venue: String, detail: String },

    /// The venue looked at the order and said no. Never retried.
    #[error("venue {venue} rejected order: {reason}")]
    VenueRejected { venue: String, reason: String },

    /// Deadline expired on a downstream call. Distinct from unreachable.
    #[error("deadline expired during {stage}")]
    Timeout { stage: &'static str },

    /// The venue's token bucket and wait queue are both exhausted.
    #[error("venue {venue} backpressure: submission queue full")]
    VenueBackpressure { venue: String },

    /// Unknown operation_id on GET / DELETE.
    #[error("unknown operation_id {0}")]
    NotFound(String),

    /// Invariant violation. Logged with full context at the raise site.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable kind for the response body.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "MALFORMED",
            Self::RiskDenied { .. } => "RISK_DENIED",
            Self::RouteUnavailable(_) => "ROUTE_UNAVAILABLE",
            Self::VenueUnreachable { .. } => "VENUE_UNREACHABLE",
            Self::VenueRejected { .. } => "VENUE_REJECTED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::VenueBackpressure { .. } => "VENUE_BACKPRESSURE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Malformed(_) => StatusCode::BAD_REQUEST,
            Self::RiskDenied { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RouteUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::VenueUnreachable { .. } => StatusCode::BAD_GATEWAY,
            Self::VenueRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::VenueBackpressure { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON body returned alongside a non-2xx status.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_reason: Option<&'static str>,
}

impl From<&GatewayError> for ErrorBody {
    fn from(err: &GatewayError) -> Self {
        let risk_reason = match err {
            GatewayError::RiskDenied { reason } => Some(reason.as_str()),
            _ => None,
        };
        Self {
            error: err.kind(),
            message: err.to_string(),
            risk_reason,
        }
    }
}

impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let body = ErrorBody::from(&self);
        (self.status_code(), axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        let err = GatewayError::VenueUnreachable {
            venue: "DERIBIT".to_string(),
            detail: "connection refused".to_string(),
        };
        assert_eq!(err.kind(), "VENUE_UNREACHABLE");
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_timeout_is_not_unreachable() {
        let timeout = GatewayError::Timeout { stage: "submit" };
        let unreachable = GatewayError::VenueUnreachable {
            venue: "DERIBIT".to_string(),
            detail: "dns".to_string(),
        };
        assert_ne!(timeout.kind(), unreachable.kind());
    }
}
