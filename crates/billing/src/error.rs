//! Billing errors and the provider-facing error code taxonomy

use thiserror::Error;
use uuid::Uuid;

use crate::model::{InvoiceStatus, Provider};

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invoice not found: {0}")]
    InvoiceNotFound(Uuid),

    #[error("Payment not found: {0}")]
    PaymentNotFound(Uuid),

    #[error("Invoice {invoice_id} is not payable (status: {status})")]
    InvoiceNotPayable {
        invoice_id: Uuid,
        status: InvoiceStatus,
    },

    #[error("Invoice {invoice_id} already has a pending {provider} payment {payment_id}")]
    PendingIntentExists {
        invoice_id: Uuid,
        provider: Provider,
        payment_id: Uuid,
    },

    #[error("Provider {0} does not accept online payment intents")]
    UnsupportedProvider(Provider),

    #[error("Provider {0} is not configured")]
    ProviderNotConfigured(Provider),

    #[error("Amount mismatch: expected {expected}, received {received}")]
    AmountMismatch { expected: i64, received: i64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Payment {0} is already cancelled")]
    AlreadyCancelled(Uuid),

    #[error("Payment {0} is already confirmed")]
    AlreadyConfirmed(Uuid),

    #[error("Payment {0} is bound to a different provider transaction")]
    TransactionConflict(Uuid),

    #[error("Provider request failed: {0}")]
    Provider(String),

    #[error("Provider request timed out")]
    ProviderTimeout,

    #[error("Provider rejected request: {0}")]
    ProviderRejected(String),
}

impl BillingError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_) | BillingError::Provider(_) | BillingError::ProviderTimeout
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BillingError::ProviderTimeout
        } else {
            BillingError::Provider(e.to_string())
        }
    }
}

/// Error codes returned to payment providers in the `error` field.
///
/// `0` is success, every negative value names exactly one failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    SignatureInvalid,
    AmountMismatch,
    AlreadyConfirmed,
    TransactionNotFound,
    Internal,
    BadRequest,
    ProviderReportedFailure,
    AlreadyCancelled,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::Success => 0,
            ErrorCode::SignatureInvalid => -1,
            ErrorCode::AmountMismatch => -2,
            ErrorCode::AlreadyConfirmed => -4,
            ErrorCode::TransactionNotFound => -6,
            ErrorCode::Internal => -7,
            ErrorCode::BadRequest => -8,
            ErrorCode::ProviderReportedFailure => -9,
            ErrorCode::AlreadyCancelled => -10,
        }
    }

    pub fn note(self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::SignatureInvalid => "SIGN CHECK FAILED",
            ErrorCode::AmountMismatch => "Incorrect amount",
            ErrorCode::AlreadyConfirmed => "Already paid",
            ErrorCode::TransactionNotFound => "Transaction does not exist",
            ErrorCode::Internal => "Failed to update payment",
            ErrorCode::BadRequest => "Error in request",
            ErrorCode::ProviderReportedFailure => "Transaction cancelled",
            ErrorCode::AlreadyCancelled => "Transaction already cancelled",
        }
    }

    /// Stable snake_case label used in logs and audit records.
    pub fn label(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::SignatureInvalid => "signature_invalid",
            ErrorCode::AmountMismatch => "amount_mismatch",
            ErrorCode::AlreadyConfirmed => "already_confirmed",
            ErrorCode::TransactionNotFound => "transaction_not_found",
            ErrorCode::Internal => "internal",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::ProviderReportedFailure => "provider_reported_failure",
            ErrorCode::AlreadyCancelled => "already_cancelled",
        }
    }
}

impl From<&BillingError> for ErrorCode {
    fn from(e: &BillingError) -> Self {
        match e {
            BillingError::PaymentNotFound(_)
            | BillingError::InvoiceNotFound(_)
            | BillingError::TransactionConflict(_) => ErrorCode::TransactionNotFound,
            BillingError::AmountMismatch { .. } => ErrorCode::AmountMismatch,
            BillingError::AlreadyCancelled(_) => ErrorCode::AlreadyCancelled,
            BillingError::AlreadyConfirmed(_) => ErrorCode::AlreadyConfirmed,
            BillingError::InvalidAmount(_) => ErrorCode::BadRequest,
            _ => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct() {
        let all = [
            ErrorCode::Success,
            ErrorCode::SignatureInvalid,
            ErrorCode::AmountMismatch,
            ErrorCode::AlreadyConfirmed,
            ErrorCode::TransactionNotFound,
            ErrorCode::Internal,
            ErrorCode::BadRequest,
            ErrorCode::ProviderReportedFailure,
            ErrorCode::AlreadyCancelled,
        ];
        let codes: std::collections::HashSet<i32> = all.iter().map(|c| c.code()).collect();
        assert_eq!(codes.len(), all.len());
        assert!(all
            .iter()
            .filter(|c| **c != ErrorCode::Success)
            .all(|c| c.code() < 0));
    }

    #[test]
    fn test_billing_error_mapping() {
        let id = Uuid::new_v4();
        assert_eq!(
            ErrorCode::from(&BillingError::PaymentNotFound(id)),
            ErrorCode::TransactionNotFound
        );
        assert_eq!(
            ErrorCode::from(&BillingError::AmountMismatch {
                expected: 1,
                received: 2
            }),
            ErrorCode::AmountMismatch
        );
        assert_eq!(
            ErrorCode::from(&BillingError::Database("down".into())),
            ErrorCode::Internal
        );
    }
}
