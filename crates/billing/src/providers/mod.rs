//! Payment provider integrations
//!
//! Each provider contributes an adapter that authenticates inbound callbacks
//! and turns them into an `InternalEvent`, and a status source the
//! reconciliation poller can query out-of-band.

mod client;
mod hosted;
mod two_phase;

pub use client::{Checkout, HostedCheckoutClient, TwoPhaseClient};
pub use hosted::{HostedCheckoutAdapter, HostedWebhookReply, HOSTED_SIGNATURE_HEADER};
pub use two_phase::{TwoPhaseAction, TwoPhaseAdapter, TwoPhaseReply};

use async_trait::async_trait;

use crate::error::{BillingResult, ErrorCode};
use crate::model::{InternalEvent, Payment, Provider};

/// An inbound provider message as received on the wire.
#[derive(Debug, Clone, Copy)]
pub struct RawMessage<'a> {
    pub body: &'a [u8],
    /// Detached signature, for providers that send one in a header
    pub signature: Option<&'a str>,
}

impl<'a> RawMessage<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self {
            body,
            signature: None,
        }
    }

    pub fn with_signature(mut self, signature: Option<&'a str>) -> Self {
        self.signature = signature;
        self
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(self.body).into_owned()
    }
}

/// Authenticates and parses a provider's inbound messages.
///
/// Parsing happens before the signature check: an unparseable body is
/// `BadRequest`, a parseable body with a bad signature is `SignatureInvalid`.
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    fn verify_and_normalize(&self, raw: &RawMessage<'_>) -> Result<InternalEvent, ErrorCode>;
}

/// What a provider reports when asked directly about a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Paid {
        provider_ref: Option<String>,
        amount: Option<i64>,
    },
    Failed {
        provider_ref: Option<String>,
    },
    Pending,
    /// The provider has no record of this payment
    Unknown,
}

/// Out-of-band status lookup used by reconciliation.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, payment: &Payment) -> BillingResult<ProviderStatus>;
}

/// Parse an amount in minor units. A trailing all-zero fraction is accepted.
pub(crate) fn parse_minor_units(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let whole = match raw.split_once('.') {
        Some((whole, fraction)) => {
            if fraction.is_empty() || !fraction.bytes().all(|b| b == b'0') {
                return None;
            }
            whole
        }
        None => raw,
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    whole.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minor_units() {
        assert_eq!(parse_minor_units("100000"), Some(100_000));
        assert_eq!(parse_minor_units("100000.00"), Some(100_000));
        assert_eq!(parse_minor_units(" 5 "), Some(5));
        assert_eq!(parse_minor_units("100000.50"), None);
        assert_eq!(parse_minor_units("100000."), None);
        assert_eq!(parse_minor_units("-5"), None);
        assert_eq!(parse_minor_units("1e5"), None);
        assert_eq!(parse_minor_units(""), None);
        assert_eq!(parse_minor_units("99999999999999999999"), None);
    }
}
