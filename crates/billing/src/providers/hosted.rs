//! Hosted checkout provider webhooks
//!
//! The tenant pays on the provider's page and the provider posts a JSON
//! webhook with the final status. Deliveries may repeat or arrive out of
//! order; the ledger makes them idempotent.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::{ProviderAdapter, RawMessage};
use crate::config::HostedCheckoutConfig;
use crate::error::{BillingError, BillingResult, ErrorCode};
use crate::events::{record_best_effort, PaymentEventBuilder, PaymentEventType};
use crate::ledger::PaymentLedger;
use crate::model::{
    EventOutcome, InternalEvent, Outcome, Payment, PaymentStatus, Phase, Provider,
};
use crate::signature::{self, DigestAlgorithm, SignedPart};

/// Header carrying the hex HMAC-SHA256 of the raw body
pub const HOSTED_SIGNATURE_HEADER: &str = "x-checkout-signature";

#[derive(Debug, Deserialize)]
struct HostedWebhook {
    #[serde(default)]
    merchant_ref: Option<String>,
    #[serde(default)]
    provider_payment_ref: Option<String>,
    status: String,
    #[serde(default)]
    amount: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostedWebhookReply {
    pub error: i32,
    pub error_note: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<Uuid>,
    #[serde(skip)]
    pub code: ErrorCode,
}

impl HostedWebhookReply {
    fn new(code: ErrorCode, payment_id: Option<Uuid>) -> Self {
        Self {
            error: code.code(),
            error_note: code.note().to_string(),
            payment_id,
            code,
        }
    }
}

pub struct HostedCheckoutAdapter {
    config: HostedCheckoutConfig,
    ledger: Arc<PaymentLedger>,
}

impl HostedCheckoutAdapter {
    pub fn new(config: HostedCheckoutConfig, ledger: Arc<PaymentLedger>) -> Self {
        Self { config, ledger }
    }

    pub async fn handle(&self, raw: &RawMessage<'_>) -> HostedWebhookReply {
        let event = match self.verify_and_normalize(raw) {
            Ok(event) => event,
            Err(code) => {
                if code == ErrorCode::SignatureInvalid {
                    record_best_effort(
                        self.ledger.audit(),
                        PaymentEventBuilder::new(PaymentEventType::SignatureRejected)
                            .provider(Provider::HostedCheckout)
                            .data(json!({ "signed": raw.signature.is_some() })),
                    )
                    .await;
                }
                return HostedWebhookReply::new(code, None);
            }
        };

        let payment = match self.resolve_payment(&event).await {
            Ok(Some(payment)) => payment,
            Ok(None) => {
                tracing::warn!(
                    merchant_ref = ?event.merchant_ref,
                    provider_payment_ref = ?event.provider_payment_ref,
                    "Hosted checkout webhook for unknown payment"
                );
                return HostedWebhookReply::new(ErrorCode::TransactionNotFound, None);
            }
            Err(e) => {
                tracing::error!(error = %e, "Payment lookup failed for hosted checkout webhook");
                return HostedWebhookReply::new(ErrorCode::Internal, None);
            }
        };

        let code = match self.apply(&event, &payment, &raw.body_text()).await {
            Ok(code) => code,
            Err(e) => {
                let code = ErrorCode::from(&e);
                if code == ErrorCode::Internal {
                    tracing::error!(payment_id = %payment.id, error = %e, "Hosted checkout webhook failed");
                } else {
                    tracing::warn!(payment_id = %payment.id, error = %e, "Hosted checkout webhook refused");
                }
                code
            }
        };

        tracing::info!(
            payment_id = %payment.id,
            outcome = ?event.outcome,
            result = code.label(),
            "Hosted checkout webhook handled"
        );
        HostedWebhookReply::new(code, Some(payment.id))
    }

    /// Dedup key is the provider reference when present, else the merchant reference.
    async fn resolve_payment(&self, event: &InternalEvent) -> BillingResult<Option<Payment>> {
        let store = self.ledger.store();
        if let Some(reference) = &event.provider_payment_ref {
            if let Some(payment) = store
                .payment_by_provider_ref(Provider::HostedCheckout, reference)
                .await?
            {
                return Ok(Some(payment));
            }
        }

        let Some(merchant_ref) = &event.merchant_ref else {
            return Ok(None);
        };
        let Ok(payment_id) = Uuid::parse_str(merchant_ref) else {
            return Ok(None);
        };
        Ok(store
            .payment(payment_id)
            .await?
            .filter(|p| p.provider == Provider::HostedCheckout))
    }

    async fn apply(
        &self,
        event: &InternalEvent,
        payment: &Payment,
        raw: &str,
    ) -> BillingResult<ErrorCode> {
        if let Some(received) = event.amount {
            if received != payment.amount {
                record_best_effort(
                    self.ledger.audit(),
                    PaymentEventBuilder::new(PaymentEventType::AmountMismatch)
                        .payment(payment.id)
                        .provider(Provider::HostedCheckout)
                        .data(json!({ "expected": payment.amount, "received": received })),
                )
                .await;
                return Err(BillingError::AmountMismatch {
                    expected: payment.amount,
                    received,
                });
            }
        }

        let provider_ref = event.provider_payment_ref.as_deref();
        match event.outcome {
            EventOutcome::Confirm => {
                let applied = self
                    .ledger
                    .apply_outcome(payment.id, Outcome::Confirm, provider_ref, Some(raw))
                    .await?;
                if applied.changed {
                    return Ok(ErrorCode::Success);
                }
                match applied.payment.status {
                    PaymentStatus::Cancelled => {
                        tracing::error!(
                            payment_id = %payment.id,
                            provider_payment_ref = ?provider_ref,
                            "Provider reports paid for a cancelled payment. RECONCILIATION NEEDED"
                        );
                    }
                    _ => {
                        record_best_effort(
                            self.ledger.audit(),
                            PaymentEventBuilder::new(PaymentEventType::DuplicateDelivery)
                                .payment(payment.id)
                                .provider(Provider::HostedCheckout)
                                .data(json!({ "status": "paid" })),
                        )
                        .await;
                    }
                }
                Ok(ErrorCode::Success)
            }
            EventOutcome::Cancel => {
                let applied = self
                    .ledger
                    .apply_outcome(payment.id, Outcome::Cancel, provider_ref, Some(raw))
                    .await?;
                if !applied.changed && applied.payment.status == PaymentStatus::Confirmed {
                    tracing::warn!(
                        payment_id = %payment.id,
                        "Failure webhook for a confirmed payment ignored"
                    );
                }
                Ok(ErrorCode::Success)
            }
            EventOutcome::StillPending | EventOutcome::Reserve => {
                tracing::debug!(payment_id = %payment.id, "Pending webhook, no state change");
                Ok(ErrorCode::Success)
            }
        }
    }
}

impl ProviderAdapter for HostedCheckoutAdapter {
    fn provider(&self) -> Provider {
        Provider::HostedCheckout
    }

    fn verify_and_normalize(&self, raw: &RawMessage<'_>) -> Result<InternalEvent, ErrorCode> {
        let body = std::str::from_utf8(raw.body).map_err(|_| ErrorCode::BadRequest)?;
        let webhook: HostedWebhook =
            serde_json::from_str(body).map_err(|_| ErrorCode::BadRequest)?;

        let outcome = match webhook.status.as_str() {
            "paid" => EventOutcome::Confirm,
            "failed" => EventOutcome::Cancel,
            "pending" => EventOutcome::StillPending,
            _ => return Err(ErrorCode::BadRequest),
        };
        let merchant_ref = webhook.merchant_ref.filter(|v| !v.is_empty());
        let provider_payment_ref = webhook.provider_payment_ref.filter(|v| !v.is_empty());
        if merchant_ref.is_none() && provider_payment_ref.is_none() {
            return Err(ErrorCode::BadRequest);
        }

        if let Some(secret) = &self.config.webhook_secret {
            let Some(provided) = raw.signature else {
                tracing::warn!("Unsigned hosted checkout webhook rejected");
                return Err(ErrorCode::SignatureInvalid);
            };
            let parts = [SignedPart::field("body", body)];
            if !signature::verify(&parts, secret, provided, DigestAlgorithm::HmacSha256) {
                tracing::warn!(
                    merchant_ref = ?merchant_ref,
                    "Hosted checkout webhook signature check failed"
                );
                return Err(ErrorCode::SignatureInvalid);
            }
        }

        Ok(InternalEvent {
            provider: Provider::HostedCheckout,
            provider_payment_ref,
            merchant_ref,
            prepare_ref: None,
            amount: webhook.amount,
            phase: Phase::Webhook,
            outcome,
            provider_error: None,
        })
    }
}
