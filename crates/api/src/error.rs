//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rentline_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    BadGateway(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match &e {
            BillingError::InvoiceNotFound(_) | BillingError::PaymentNotFound(_) => {
                ApiError::NotFound(e.to_string())
            }
            BillingError::InvoiceNotPayable { .. }
            | BillingError::PendingIntentExists { .. }
            | BillingError::AlreadyCancelled(_)
            | BillingError::AlreadyConfirmed(_)
            | BillingError::TransactionConflict(_) => ApiError::Conflict(e.to_string()),
            BillingError::UnsupportedProvider(_)
            | BillingError::InvalidAmount(_)
            | BillingError::AmountMismatch { .. } => ApiError::BadRequest(e.to_string()),
            BillingError::ProviderNotConfigured(_) => ApiError::ServiceUnavailable(e.to_string()),
            BillingError::Provider(_)
            | BillingError::ProviderTimeout
            | BillingError::ProviderRejected(_) => ApiError::BadGateway(e.to_string()),
            BillingError::Config(_) | BillingError::Database(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            ApiError::ServiceUnavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),
            ApiError::BadGateway(m) => {
                tracing::warn!(error = %m, "Provider call failed");
                (StatusCode::BAD_GATEWAY, "Payment provider unavailable".to_string())
            }
            ApiError::Internal(m) => {
                tracing::error!(error = %m, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rentline_billing::{InvoiceStatus, Provider};
    use uuid::Uuid;

    #[test]
    fn test_billing_error_mapping() {
        let id = Uuid::new_v4();
        assert!(matches!(
            ApiError::from(BillingError::InvoiceNotFound(id)),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(BillingError::InvoiceNotPayable {
                invoice_id: id,
                status: InvoiceStatus::Paid
            }),
            ApiError::Conflict(_)
        ));
        assert!(matches!(
            ApiError::from(BillingError::ProviderNotConfigured(Provider::TwoPhase)),
            ApiError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            ApiError::from(BillingError::ProviderTimeout),
            ApiError::BadGateway(_)
        ));
        assert!(matches!(
            ApiError::from(BillingError::Database("pool timed out".into())),
            ApiError::Internal(_)
        ));
        assert!(matches!(
            ApiError::from(BillingError::Config("TWO_PHASE_API_BASE must be set".into())),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn test_internal_error_hides_detail() {
        let response = ApiError::Internal("connection reset".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
