//! Payment ledger
//!
//! The only code path that changes payment status, invoice status or the
//! cached tenant balance. Every operation runs as one `LedgerTx`: the payment
//! row is locked first, then the invoice row, and everything commits together
//! or not at all. Audit events are written after commit.

use std::sync::Arc;

use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{record_best_effort, AuditSink, PaymentEventBuilder, PaymentEventType};
use crate::model::{
    confirmed_total, Balance, Invoice, InvoiceStatus, Outcome, Payment, PaymentStatus, Provider,
};
use crate::store::{LedgerTx, PaymentStore};

/// Result of applying an outcome to a payment
#[derive(Debug, Clone)]
pub struct Applied {
    /// Payment as it stands after the call
    pub payment: Payment,
    /// False when the payment was already terminal and nothing was written
    pub changed: bool,
    /// True when this call flipped the invoice to paid
    pub invoice_paid: bool,
}

/// Result of a two-phase prepare reservation
#[derive(Debug, Clone)]
pub struct Reservation {
    pub prepare_ref: String,
    /// True when an earlier prepare for the same provider transaction was found
    pub reused: bool,
    pub payment: Payment,
}

pub struct PaymentLedger {
    store: Arc<dyn PaymentStore>,
    audit: Arc<dyn AuditSink>,
}

impl PaymentLedger {
    pub fn new(store: Arc<dyn PaymentStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    pub fn store(&self) -> &Arc<dyn PaymentStore> {
        &self.store
    }

    pub fn audit(&self) -> &dyn AuditSink {
        self.audit.as_ref()
    }

    pub async fn payment(&self, payment_id: Uuid) -> BillingResult<Payment> {
        self.store
            .payment(payment_id)
            .await?
            .ok_or(BillingError::PaymentNotFound(payment_id))
    }

    pub async fn invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        self.store
            .invoice(invoice_id)
            .await?
            .ok_or(BillingError::InvoiceNotFound(invoice_id))
    }

    /// Move a pending payment to its terminal state.
    ///
    /// Terminal payments are returned untouched with `changed = false`, which
    /// makes repeated confirmations and late cancellations harmless.
    pub async fn apply_outcome(
        &self,
        payment_id: Uuid,
        outcome: Outcome,
        provider_ref: Option<&str>,
        raw_payload: Option<&str>,
    ) -> BillingResult<Applied> {
        let mut tx = self.store.begin().await?;

        let mut payment = tx
            .lock_payment(payment_id)
            .await?
            .ok_or(BillingError::PaymentNotFound(payment_id))?;

        if payment.status.is_terminal() {
            tracing::debug!(
                payment_id = %payment_id,
                status = %payment.status,
                requested = ?outcome,
                "Payment already terminal, outcome ignored"
            );
            return Ok(Applied {
                payment,
                changed: false,
                invoice_paid: false,
            });
        }

        payment.status = outcome.target_status();
        if let Some(reference) = provider_ref {
            match payment.provider_payment_ref.as_deref() {
                None => payment.provider_payment_ref = Some(reference.to_string()),
                Some(existing) if existing != reference => {
                    tracing::warn!(
                        payment_id = %payment_id,
                        existing = %existing,
                        received = %reference,
                        "Provider reference differs from the one on file, keeping the original"
                    );
                }
                Some(_) => {}
            }
        }
        if let Some(raw) = raw_payload {
            payment.raw_payload = Some(raw.to_string());
        }
        if outcome == Outcome::Confirm {
            payment.paid_at = Some(OffsetDateTime::now_utc());
        }
        tx.update_payment(&payment).await?;

        let mut invoice_paid = false;
        if outcome == Outcome::Confirm {
            invoice_paid = settle_invoice(tx.as_mut(), payment.invoice_id).await?;
            tx.recompute_balance(payment.tenant_id).await?;
        }

        tx.commit().await?;

        tracing::info!(
            payment_id = %payment.id,
            invoice_id = %payment.invoice_id,
            provider = %payment.provider,
            status = %payment.status,
            invoice_paid = invoice_paid,
            "Payment outcome applied"
        );

        let event_type = match outcome {
            Outcome::Confirm => PaymentEventType::PaymentConfirmed,
            Outcome::Cancel => PaymentEventType::PaymentCancelled,
        };
        record_best_effort(
            self.audit.as_ref(),
            PaymentEventBuilder::new(event_type)
                .payment(payment.id)
                .invoice(payment.invoice_id)
                .provider(payment.provider)
                .data(json!({
                    "amount": payment.amount,
                    "provider_payment_ref": payment.provider_payment_ref,
                })),
        )
        .await;
        if invoice_paid {
            self.record_invoice_paid(&payment).await;
        }

        Ok(Applied {
            payment,
            changed: true,
            invoice_paid,
        })
    }

    /// Create a pending online payment for the full invoice amount.
    pub async fn open_intent(&self, invoice_id: Uuid, provider: Provider) -> BillingResult<Payment> {
        if !provider.is_online() {
            return Err(BillingError::UnsupportedProvider(provider));
        }

        let mut tx = self.store.begin().await?;
        let invoice = tx
            .lock_invoice(invoice_id)
            .await?
            .ok_or(BillingError::InvoiceNotFound(invoice_id))?;

        if !invoice.status.is_payable() {
            return Err(BillingError::InvoiceNotPayable {
                invoice_id,
                status: invoice.status,
            });
        }

        let existing = tx.payments_for_invoice(invoice_id).await?;
        if let Some(open) = existing
            .iter()
            .find(|p| p.provider == provider && p.status == PaymentStatus::Pending)
        {
            return Err(BillingError::PendingIntentExists {
                invoice_id,
                provider,
                payment_id: open.id,
            });
        }

        let payment = Payment::intent(&invoice, provider, OffsetDateTime::now_utc());
        tx.insert_payment(&payment).await?;
        tx.commit().await?;

        tracing::info!(
            payment_id = %payment.id,
            invoice_id = %invoice_id,
            provider = %provider,
            amount = payment.amount,
            "Payment intent created"
        );
        record_best_effort(
            self.audit.as_ref(),
            PaymentEventBuilder::new(PaymentEventType::IntentCreated)
                .payment(payment.id)
                .invoice(invoice_id)
                .provider(provider)
                .data(json!({ "amount": payment.amount })),
        )
        .await;

        Ok(payment)
    }

    /// Reserve a two-phase payment for one provider transaction.
    ///
    /// A repeated prepare for the same transaction returns the reference
    /// issued the first time.
    pub async fn reserve(
        &self,
        payment_id: Uuid,
        provider_txn_id: &str,
        amount: i64,
        raw_payload: &str,
    ) -> BillingResult<Reservation> {
        let mut tx = self.store.begin().await?;

        let mut payment = tx
            .lock_payment(payment_id)
            .await?
            .filter(|p| p.provider == Provider::TwoPhase)
            .ok_or(BillingError::PaymentNotFound(payment_id))?;

        if amount != payment.amount {
            return Err(BillingError::AmountMismatch {
                expected: payment.amount,
                received: amount,
            });
        }
        if payment.status == PaymentStatus::Cancelled {
            return Err(BillingError::AlreadyCancelled(payment_id));
        }

        let bound_txn = payment.provider_payment_ref.as_deref();
        if let Some(prepare_ref) = payment.prepare_ref.clone() {
            if bound_txn == Some(provider_txn_id) {
                return Ok(Reservation {
                    prepare_ref,
                    reused: true,
                    payment,
                });
            }
        }
        if payment.status == PaymentStatus::Confirmed {
            return Err(BillingError::AlreadyConfirmed(payment_id));
        }
        if bound_txn.is_some_and(|txn| txn != provider_txn_id) {
            tracing::warn!(
                payment_id = %payment_id,
                provider_txn_id = %provider_txn_id,
                "Prepare for a payment bound to another provider transaction"
            );
            return Err(BillingError::TransactionConflict(payment_id));
        }

        let prepare_ref = Uuid::new_v4().simple().to_string();
        payment.prepare_ref = Some(prepare_ref.clone());
        payment.provider_payment_ref = Some(provider_txn_id.to_string());
        payment.raw_payload = Some(raw_payload.to_string());
        tx.update_payment(&payment).await?;
        tx.commit().await?;

        tracing::info!(
            payment_id = %payment_id,
            provider_txn_id = %provider_txn_id,
            prepare_ref = %prepare_ref,
            "Two-phase payment reserved"
        );
        record_best_effort(
            self.audit.as_ref(),
            PaymentEventBuilder::new(PaymentEventType::PrepareAccepted)
                .payment(payment_id)
                .invoice(payment.invoice_id)
                .provider(Provider::TwoPhase)
                .data(json!({
                    "provider_txn_id": provider_txn_id,
                    "prepare_ref": prepare_ref,
                })),
        )
        .await;

        Ok(Reservation {
            prepare_ref,
            reused: false,
            payment,
        })
    }

    /// Record the provider's reference for a payment. Set once; a different
    /// value later is a conflict.
    pub async fn attach_provider_ref(
        &self,
        payment_id: Uuid,
        provider_ref: &str,
    ) -> BillingResult<Payment> {
        let mut tx = self.store.begin().await?;
        let mut payment = tx
            .lock_payment(payment_id)
            .await?
            .ok_or(BillingError::PaymentNotFound(payment_id))?;

        match payment.provider_payment_ref.as_deref() {
            Some(existing) if existing == provider_ref => return Ok(payment),
            Some(_) => return Err(BillingError::TransactionConflict(payment_id)),
            None => {}
        }

        payment.provider_payment_ref = Some(provider_ref.to_string());
        tx.update_payment(&payment).await?;
        tx.commit().await?;

        tracing::debug!(
            payment_id = %payment_id,
            provider_ref = %provider_ref,
            "Provider reference attached"
        );
        Ok(payment)
    }

    /// Record cash or bank-transfer money taken by a collector.
    ///
    /// The payment is created confirmed and the invoice settled in the same
    /// transaction.
    pub async fn record_offline_payment(
        &self,
        invoice_id: Uuid,
        amount: i64,
        collector_note: &str,
    ) -> BillingResult<Applied> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(format!(
                "offline payment amount must be positive, got {}",
                amount
            )));
        }

        let mut tx = self.store.begin().await?;
        let invoice = tx
            .lock_invoice(invoice_id)
            .await?
            .ok_or(BillingError::InvoiceNotFound(invoice_id))?;

        if invoice.status == InvoiceStatus::Cancelled {
            return Err(BillingError::InvoiceNotPayable {
                invoice_id,
                status: invoice.status,
            });
        }

        let payment = Payment::offline(&invoice, amount, collector_note, OffsetDateTime::now_utc());
        tx.insert_payment(&payment).await?;
        let invoice_paid = settle_invoice(tx.as_mut(), invoice_id).await?;
        tx.recompute_balance(invoice.tenant_id).await?;
        tx.commit().await?;

        tracing::info!(
            payment_id = %payment.id,
            invoice_id = %invoice_id,
            amount = amount,
            invoice_paid = invoice_paid,
            "Offline payment recorded"
        );
        record_best_effort(
            self.audit.as_ref(),
            PaymentEventBuilder::new(PaymentEventType::OfflinePaymentRecorded)
                .payment(payment.id)
                .invoice(invoice_id)
                .provider(Provider::Offline)
                .data(json!({ "amount": amount, "collector_note": collector_note })),
        )
        .await;
        if invoice_paid {
            self.record_invoice_paid(&payment).await;
        }

        Ok(Applied {
            payment,
            changed: true,
            invoice_paid,
        })
    }

    /// Recompute the cached balance for a tenant from invoices and payments.
    pub async fn rebuild_balance(&self, tenant_id: Uuid) -> BillingResult<Balance> {
        let mut tx = self.store.begin().await?;
        let balance = tx.recompute_balance(tenant_id).await?;
        tx.commit().await?;
        Ok(balance)
    }

    async fn record_invoice_paid(&self, payment: &Payment) {
        record_best_effort(
            self.audit.as_ref(),
            PaymentEventBuilder::new(PaymentEventType::InvoicePaid)
                .payment(payment.id)
                .invoice(payment.invoice_id)
                .provider(payment.provider),
        )
        .await;
    }
}

/// Flip the invoice to paid once confirmed payments cover it.
///
/// Returns true when this call changed the invoice.
async fn settle_invoice(tx: &mut dyn LedgerTx, invoice_id: Uuid) -> BillingResult<bool> {
    let invoice = tx
        .lock_invoice(invoice_id)
        .await?
        .ok_or(BillingError::InvoiceNotFound(invoice_id))?;

    let payments = tx.payments_for_invoice(invoice_id).await?;
    let paid = confirmed_total(&payments);

    if invoice.status == InvoiceStatus::Cancelled {
        tracing::warn!(
            invoice_id = %invoice_id,
            paid = paid,
            "Confirmed payment on a cancelled invoice"
        );
        return Ok(false);
    }

    if invoice.status.is_payable() && paid >= invoice.amount {
        tx.set_invoice_status(invoice_id, InvoiceStatus::Paid).await?;
        if paid > invoice.amount {
            tracing::info!(
                invoice_id = %invoice_id,
                overpaid_by = paid - invoice.amount,
                "Invoice overpaid"
            );
        }
        return Ok(true);
    }

    Ok(false)
}
