//! Two-phase (prepare/complete) provider
//!
//! The provider first asks us to reserve a payment (prepare), then tells us
//! whether the customer actually paid (complete). Both calls are form posts
//! signed with MD5 over a fixed field order with the merchant secret in the
//! middle. We always answer HTTP 200; the outcome is in the `error` field.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::{parse_minor_units, ProviderAdapter, RawMessage};
use crate::config::TwoPhaseConfig;
use crate::error::{BillingError, ErrorCode};
use crate::events::{record_best_effort, PaymentEventBuilder, PaymentEventType};
use crate::ledger::PaymentLedger;
use crate::model::{
    EventOutcome, InternalEvent, Outcome, Payment, PaymentStatus, Phase, Provider,
};
use crate::signature::{self, DigestAlgorithm, SignedPart};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoPhaseAction {
    Prepare,
    Complete,
}

impl TwoPhaseAction {
    pub fn as_wire(self) -> &'static str {
        match self {
            TwoPhaseAction::Prepare => "0",
            TwoPhaseAction::Complete => "1",
        }
    }

    fn from_wire(raw: &str) -> Option<Self> {
        match raw.trim() {
            "0" => Some(TwoPhaseAction::Prepare),
            "1" => Some(TwoPhaseAction::Complete),
            _ => None,
        }
    }

    fn phase(self) -> Phase {
        match self {
            TwoPhaseAction::Prepare => Phase::Prepare,
            TwoPhaseAction::Complete => Phase::Complete,
        }
    }
}

/// Form fields as posted. Everything is optional here so that a missing
/// field is reported as a bad request rather than a decode failure.
#[derive(Debug, Default, Deserialize)]
struct TwoPhaseForm {
    provider_txn_id: Option<String>,
    service_id: Option<String>,
    merchant_ref: Option<String>,
    prepare_ref: Option<String>,
    amount: Option<String>,
    action: Option<String>,
    error: Option<String>,
    error_note: Option<String>,
    sign_time: Option<String>,
    sign: Option<String>,
}

/// A structurally valid request. Raw strings are kept for signing.
#[derive(Debug)]
struct TwoPhaseRequest {
    action: TwoPhaseAction,
    provider_txn_id: String,
    service_id: String,
    merchant_ref: String,
    prepare_ref: Option<String>,
    amount_raw: String,
    amount: i64,
    action_raw: String,
    error: i32,
    error_note: Option<String>,
    sign_time: String,
    sign: String,
}

impl TwoPhaseRequest {
    fn signed_parts(&self) -> Vec<SignedPart<'_>> {
        let mut parts = vec![
            SignedPart::field("provider_txn_id", &self.provider_txn_id),
            SignedPart::field("service_id", &self.service_id),
            SignedPart::Secret,
            SignedPart::field("merchant_ref", &self.merchant_ref),
        ];
        if let Some(prepare_ref) = &self.prepare_ref {
            parts.push(SignedPart::field("prepare_ref", prepare_ref));
        }
        parts.push(SignedPart::field("amount", &self.amount_raw));
        parts.push(SignedPart::field("action", &self.action_raw));
        parts.push(SignedPart::field("sign_time", &self.sign_time));
        parts
    }

    fn normalize(&self) -> InternalEvent {
        let outcome = match self.action {
            TwoPhaseAction::Prepare => EventOutcome::Reserve,
            TwoPhaseAction::Complete if self.error < 0 => EventOutcome::Cancel,
            TwoPhaseAction::Complete => EventOutcome::Confirm,
        };
        InternalEvent {
            provider: Provider::TwoPhase,
            provider_payment_ref: Some(self.provider_txn_id.clone()),
            merchant_ref: Some(self.merchant_ref.clone()),
            prepare_ref: self.prepare_ref.clone(),
            amount: Some(self.amount),
            phase: self.action.phase(),
            outcome,
            provider_error: (self.error != 0).then_some(self.error),
        }
    }
}

/// Response body for prepare and complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TwoPhaseReply {
    pub provider_txn_id: String,
    pub merchant_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prepare_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_ref: Option<String>,
    pub error: i32,
    pub error_note: String,
    #[serde(skip)]
    pub code: ErrorCode,
}

impl TwoPhaseReply {
    fn new(provider_txn_id: &str, merchant_ref: &str, code: ErrorCode) -> Self {
        Self {
            provider_txn_id: provider_txn_id.to_string(),
            merchant_ref: merchant_ref.to_string(),
            prepare_ref: None,
            confirm_ref: None,
            error: code.code(),
            error_note: code.note().to_string(),
            code,
        }
    }

    fn with_prepare_ref(mut self, prepare_ref: String) -> Self {
        self.prepare_ref = Some(prepare_ref);
        self
    }

    fn with_confirm_ref(mut self, payment_id: Uuid) -> Self {
        self.confirm_ref = Some(payment_id.to_string());
        self
    }

    fn for_request(request: &TwoPhaseRequest, code: ErrorCode) -> Self {
        Self::new(&request.provider_txn_id, &request.merchant_ref, code)
    }
}

struct Rejection {
    code: ErrorCode,
    provider_txn_id: String,
    merchant_ref: String,
}

pub struct TwoPhaseAdapter {
    config: TwoPhaseConfig,
    ledger: Arc<PaymentLedger>,
}

impl TwoPhaseAdapter {
    pub fn new(config: TwoPhaseConfig, ledger: Arc<PaymentLedger>) -> Self {
        Self { config, ledger }
    }

    pub fn config(&self) -> &TwoPhaseConfig {
        &self.config
    }

    /// Handle a prepare or complete call posted to the endpoint for `action`.
    pub async fn handle(&self, body: &[u8], action: TwoPhaseAction) -> TwoPhaseReply {
        let request = match self.authenticate(body, Some(action)) {
            Ok(request) => request,
            Err(rejection) => {
                if rejection.code == ErrorCode::SignatureInvalid {
                    record_best_effort(
                        self.ledger.audit(),
                        PaymentEventBuilder::new(PaymentEventType::SignatureRejected)
                            .provider(Provider::TwoPhase)
                            .data(json!({
                                "phase": action.as_wire(),
                                "provider_txn_id": rejection.provider_txn_id,
                                "merchant_ref": rejection.merchant_ref,
                            })),
                    )
                    .await;
                }
                return TwoPhaseReply::new(
                    &rejection.provider_txn_id,
                    &rejection.merchant_ref,
                    rejection.code,
                );
            }
        };

        let raw = String::from_utf8_lossy(body);
        let reply = match action {
            TwoPhaseAction::Prepare => self.prepare(&request, &raw).await,
            TwoPhaseAction::Complete => self.complete(&request, &raw).await,
        };

        tracing::info!(
            action = ?action,
            provider_txn_id = %request.provider_txn_id,
            merchant_ref = %request.merchant_ref,
            error = reply.error,
            outcome = reply.code.label(),
            "Two-phase callback handled"
        );
        reply
    }

    async fn prepare(&self, request: &TwoPhaseRequest, raw: &str) -> TwoPhaseReply {
        let Ok(payment_id) = Uuid::parse_str(&request.merchant_ref) else {
            return TwoPhaseReply::for_request(request, ErrorCode::TransactionNotFound);
        };

        match self
            .ledger
            .reserve(payment_id, &request.provider_txn_id, request.amount, raw)
            .await
        {
            Ok(reservation) => {
                if reservation.reused {
                    tracing::debug!(
                        payment_id = %payment_id,
                        prepare_ref = %reservation.prepare_ref,
                        "Repeated prepare, returning existing reference"
                    );
                }
                TwoPhaseReply::for_request(request, ErrorCode::Success)
                    .with_prepare_ref(reservation.prepare_ref)
            }
            Err(e) => self.reply_for_error(request, payment_id, &e).await,
        }
    }

    async fn complete(&self, request: &TwoPhaseRequest, raw: &str) -> TwoPhaseReply {
        let payment = match Uuid::parse_str(&request.merchant_ref) {
            Ok(id) => self.ledger.store().payment(id).await,
            Err(_) => Ok(None),
        };
        let payment: Payment = match payment {
            Ok(Some(p)) if p.provider == Provider::TwoPhase => p,
            Ok(_) => return TwoPhaseReply::for_request(request, ErrorCode::TransactionNotFound),
            Err(e) => {
                tracing::error!(error = %e, "Payment lookup failed during complete");
                return TwoPhaseReply::for_request(request, ErrorCode::Internal);
            }
        };

        if request.error < 0 {
            return self.cancel_reported_failure(request, &payment, raw).await;
        }

        let prepare_matches = payment.prepare_ref.is_some()
            && payment.prepare_ref == request.prepare_ref
            && payment.provider_payment_ref.as_deref() == Some(request.provider_txn_id.as_str());
        if !prepare_matches {
            tracing::warn!(
                payment_id = %payment.id,
                provider_txn_id = %request.provider_txn_id,
                "Complete references a prepare we did not issue"
            );
            return TwoPhaseReply::for_request(request, ErrorCode::TransactionNotFound);
        }

        match payment.status {
            PaymentStatus::Confirmed => {
                tracing::info!(
                    payment_id = %payment.id,
                    outcome = ErrorCode::AlreadyConfirmed.label(),
                    "Repeated complete for a confirmed payment"
                );
                return TwoPhaseReply::for_request(request, ErrorCode::Success)
                    .with_confirm_ref(payment.id);
            }
            PaymentStatus::Cancelled => {
                return TwoPhaseReply::for_request(request, ErrorCode::AlreadyCancelled);
            }
            PaymentStatus::Pending => {}
        }

        if request.amount != payment.amount {
            let err = BillingError::AmountMismatch {
                expected: payment.amount,
                received: request.amount,
            };
            return self.reply_for_error(request, payment.id, &err).await;
        }

        match self
            .ledger
            .apply_outcome(
                payment.id,
                Outcome::Confirm,
                Some(&request.provider_txn_id),
                Some(raw),
            )
            .await
        {
            Ok(applied) => match applied.payment.status {
                PaymentStatus::Cancelled => {
                    TwoPhaseReply::for_request(request, ErrorCode::AlreadyCancelled)
                }
                _ => TwoPhaseReply::for_request(request, ErrorCode::Success)
                    .with_confirm_ref(payment.id),
            },
            Err(e) => self.reply_for_error(request, payment.id, &e).await,
        }
    }

    async fn cancel_reported_failure(
        &self,
        request: &TwoPhaseRequest,
        payment: &Payment,
        raw: &str,
    ) -> TwoPhaseReply {
        match self
            .ledger
            .apply_outcome(
                payment.id,
                Outcome::Cancel,
                Some(&request.provider_txn_id),
                Some(raw),
            )
            .await
        {
            Ok(applied) => {
                if applied.payment.status == PaymentStatus::Confirmed {
                    tracing::warn!(
                        payment_id = %payment.id,
                        provider_error = request.error,
                        error_note = ?request.error_note,
                        "Provider reported failure for a confirmed payment, keeping confirmation"
                    );
                }
                TwoPhaseReply::for_request(request, ErrorCode::ProviderReportedFailure)
            }
            Err(e) => self.reply_for_error(request, payment.id, &e).await,
        }
    }

    async fn reply_for_error(
        &self,
        request: &TwoPhaseRequest,
        payment_id: Uuid,
        error: &BillingError,
    ) -> TwoPhaseReply {
        let code = ErrorCode::from(error);
        match code {
            ErrorCode::Internal => tracing::error!(
                payment_id = %payment_id,
                error = %error,
                "Two-phase callback failed"
            ),
            _ => tracing::warn!(
                payment_id = %payment_id,
                error = %error,
                outcome = code.label(),
                "Two-phase callback refused"
            ),
        }

        if let BillingError::AmountMismatch { expected, received } = error {
            record_best_effort(
                self.ledger.audit(),
                PaymentEventBuilder::new(PaymentEventType::AmountMismatch)
                    .payment(payment_id)
                    .provider(Provider::TwoPhase)
                    .data(json!({
                        "expected": expected,
                        "received": received,
                        "provider_txn_id": request.provider_txn_id,
                    })),
            )
            .await;
        }

        TwoPhaseReply::for_request(request, code)
    }

    /// Decode, validate and verify a request. With `expected` set, the
    /// `action` field must match it.
    fn authenticate(
        &self,
        body: &[u8],
        expected: Option<TwoPhaseAction>,
    ) -> Result<TwoPhaseRequest, Rejection> {
        let Ok(form) = serde_urlencoded::from_bytes::<TwoPhaseForm>(body) else {
            return Err(Rejection {
                code: ErrorCode::BadRequest,
                provider_txn_id: String::new(),
                merchant_ref: String::new(),
            });
        };

        let provider_txn_id = form.provider_txn_id.clone().unwrap_or_default();
        let merchant_ref = form.merchant_ref.clone().unwrap_or_default();
        let reject = |code: ErrorCode| Rejection {
            code,
            provider_txn_id: provider_txn_id.clone(),
            merchant_ref: merchant_ref.clone(),
        };

        let request = self
            .validate(form, expected)
            .ok_or_else(|| reject(ErrorCode::BadRequest))?;

        if !signature::verify(
            &request.signed_parts(),
            &self.config.secret_key,
            &request.sign,
            DigestAlgorithm::Md5,
        ) {
            tracing::warn!(
                provider_txn_id = %request.provider_txn_id,
                merchant_ref = %request.merchant_ref,
                action = ?request.action,
                "Two-phase signature check failed"
            );
            return Err(reject(ErrorCode::SignatureInvalid));
        }

        Ok(request)
    }

    fn validate(
        &self,
        form: TwoPhaseForm,
        expected: Option<TwoPhaseAction>,
    ) -> Option<TwoPhaseRequest> {
        let action_raw = form.action?;
        let action = TwoPhaseAction::from_wire(&action_raw)?;
        if expected.is_some_and(|e| e != action) {
            return None;
        }

        let service_id = form.service_id?;
        if service_id != self.config.service_id {
            tracing::warn!(service_id = %service_id, "Two-phase callback for a foreign service");
            return None;
        }

        let prepare_ref = match action {
            TwoPhaseAction::Prepare => None,
            TwoPhaseAction::Complete => Some(form.prepare_ref?),
        };

        let amount_raw = form.amount?;
        let amount = parse_minor_units(&amount_raw)?;
        let error = match form.error.as_deref().map(str::trim) {
            None | Some("") => 0,
            Some(raw) => raw.parse().ok()?,
        };

        Some(TwoPhaseRequest {
            action,
            provider_txn_id: form.provider_txn_id.filter(|v| !v.is_empty())?,
            service_id,
            merchant_ref: form.merchant_ref.filter(|v| !v.is_empty())?,
            prepare_ref,
            amount_raw,
            amount,
            action_raw,
            error,
            error_note: form.error_note,
            sign_time: form.sign_time?,
            sign: form.sign?,
        })
    }
}

impl ProviderAdapter for TwoPhaseAdapter {
    fn provider(&self) -> Provider {
        Provider::TwoPhase
    }

    fn verify_and_normalize(&self, raw: &RawMessage<'_>) -> Result<InternalEvent, ErrorCode> {
        self.authenticate(raw.body, None)
            .map(|request| request.normalize())
            .map_err(|rejection| rejection.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryAuditSink;
    use crate::model::{Invoice, InvoiceStatus};
    use crate::store::{InMemoryPaymentStore, PaymentStore};
    use time::macros::date;

    const SECRET: &str = "two-phase-secret";

    fn config() -> TwoPhaseConfig {
        TwoPhaseConfig {
            service_id: "77".into(),
            merchant_id: "m-1".into(),
            merchant_user_id: "u-1".into(),
            secret_key: SECRET.into(),
            api_base: "http://localhost".into(),
            pay_url: None,
            return_url: None,
        }
    }

    fn form(fields: &[(&str, &str)], prepare_ref: Option<&str>) -> Vec<u8> {
        let get = |k: &str| {
            fields
                .iter()
                .find(|(name, _)| *name == k)
                .map(|(_, v)| *v)
                .unwrap_or("")
        };
        let mut parts = vec![
            SignedPart::field("provider_txn_id", get("provider_txn_id")),
            SignedPart::field("service_id", get("service_id")),
            SignedPart::Secret,
            SignedPart::field("merchant_ref", get("merchant_ref")),
        ];
        if let Some(p) = prepare_ref {
            parts.push(SignedPart::field("prepare_ref", p));
        }
        parts.push(SignedPart::field("amount", get("amount")));
        parts.push(SignedPart::field("action", get("action")));
        parts.push(SignedPart::field("sign_time", get("sign_time")));
        let sign = signature::compute(&parts, SECRET, DigestAlgorithm::Md5);

        let mut all: Vec<(&str, &str)> = fields.to_vec();
        if let Some(p) = prepare_ref {
            all.push(("prepare_ref", p));
        }
        all.push(("sign", &sign));
        serde_urlencoded::to_string(&all).unwrap().into_bytes()
    }

    async fn setup() -> (TwoPhaseAdapter, Arc<PaymentLedger>, InMemoryPaymentStore, Uuid) {
        let store = InMemoryPaymentStore::new();
        let invoice = Invoice {
            id: Uuid::new_v4(),
            contract_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            amount: 100_000,
            due_date: date!(2026 - 11 - 01),
            status: InvoiceStatus::Pending,
        };
        store.insert_invoice(invoice.clone()).await;
        let ledger = Arc::new(PaymentLedger::new(
            Arc::new(store.clone()),
            Arc::new(MemoryAuditSink::new()),
        ));
        let payment = ledger.open_intent(invoice.id, Provider::TwoPhase).await.unwrap();
        (
            TwoPhaseAdapter::new(config(), Arc::clone(&ledger)),
            ledger,
            store,
            payment.id,
        )
    }

    #[tokio::test]
    async fn test_prepare_then_complete_confirms() {
        let (adapter, _ledger, store, payment_id) = setup().await;
        let merchant_ref = payment_id.to_string();

        let prepare = form(
            &[
                ("provider_txn_id", "9001"),
                ("service_id", "77"),
                ("merchant_ref", merchant_ref.as_str()),
                ("amount", "100000"),
                ("action", "0"),
                ("error", "0"),
                ("sign_time", "2026-10-19 10:00:00"),
            ],
            None,
        );
        let reply = adapter.handle(&prepare, TwoPhaseAction::Prepare).await;
        assert_eq!(reply.error, 0);
        let prepare_ref = reply.prepare_ref.unwrap();

        let complete = form(
            &[
                ("provider_txn_id", "9001"),
                ("service_id", "77"),
                ("merchant_ref", merchant_ref.as_str()),
                ("amount", "100000"),
                ("action", "1"),
                ("error", "0"),
                ("sign_time", "2026-10-19 10:00:05"),
            ],
            Some(prepare_ref.as_str()),
        );
        let reply = adapter.handle(&complete, TwoPhaseAction::Complete).await;
        assert_eq!(reply.error, 0);
        assert_eq!(reply.confirm_ref, Some(merchant_ref));

        let payment = store.payment(payment_id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_missing_field_is_bad_request() {
        let (adapter, _ledger, _store, payment_id) = setup().await;
        let body = form(
            &[
                ("provider_txn_id", "9001"),
                ("service_id", "77"),
                ("merchant_ref", payment_id.to_string().as_str()),
                ("action", "0"),
                ("sign_time", "t"),
            ],
            None,
        );
        let reply = adapter.handle(&body, TwoPhaseAction::Prepare).await;
        assert_eq!(reply.code, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_action_must_match_endpoint() {
        let (adapter, _ledger, _store, payment_id) = setup().await;
        let body = form(
            &[
                ("provider_txn_id", "9001"),
                ("service_id", "77"),
                ("merchant_ref", payment_id.to_string().as_str()),
                ("amount", "100000"),
                ("action", "1"),
                ("sign_time", "t"),
            ],
            None,
        );
        let reply = adapter.handle(&body, TwoPhaseAction::Prepare).await;
        assert_eq!(reply.code, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_foreign_service_id_is_bad_request() {
        let (adapter, _ledger, _store, payment_id) = setup().await;
        let body = form(
            &[
                ("provider_txn_id", "9001"),
                ("service_id", "78"),
                ("merchant_ref", payment_id.to_string().as_str()),
                ("amount", "100000"),
                ("action", "0"),
                ("sign_time", "t"),
            ],
            None,
        );
        let reply = adapter.handle(&body, TwoPhaseAction::Prepare).await;
        assert_eq!(reply.code, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_unknown_merchant_ref_is_not_found() {
        let (adapter, _ledger, _store, _payment_id) = setup().await;
        let body = form(
            &[
                ("provider_txn_id", "9001"),
                ("service_id", "77"),
                ("merchant_ref", Uuid::new_v4().to_string().as_str()),
                ("amount", "100000"),
                ("action", "0"),
                ("sign_time", "t"),
            ],
            None,
        );
        let reply = adapter.handle(&body, TwoPhaseAction::Prepare).await;
        assert_eq!(reply.code, ErrorCode::TransactionNotFound);
        assert_eq!(reply.error, -6);
    }

    #[tokio::test]
    async fn test_verify_and_normalize_maps_complete_with_error_to_cancel() {
        let (adapter, _ledger, _store, payment_id) = setup().await;
        let body = form(
            &[
                ("provider_txn_id", "9001"),
                ("service_id", "77"),
                ("merchant_ref", payment_id.to_string().as_str()),
                ("amount", "100000.00"),
                ("action", "1"),
                ("error", "-5017"),
                ("sign_time", "t"),
            ],
            Some("abc"),
        );
        let event = adapter
            .verify_and_normalize(&RawMessage::new(&body))
            .unwrap();
        assert_eq!(event.phase, Phase::Complete);
        assert_eq!(event.outcome, EventOutcome::Cancel);
        assert_eq!(event.amount, Some(100_000));
        assert_eq!(event.provider_error, Some(-5017));
        assert_eq!(event.prepare_ref.as_deref(), Some("abc"));
    }
}
