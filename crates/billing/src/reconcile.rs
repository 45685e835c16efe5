//! Reconciliation of stuck payments
//!
//! Pulls the provider's own view of a pending payment and feeds it through
//! the same ledger path as webhooks. Used for tenant-initiated refreshes and
//! by the worker's scheduled sweep.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::ReconcileConfig;
use crate::error::BillingResult;
use crate::events::{record_best_effort, PaymentEventBuilder, PaymentEventType};
use crate::ledger::PaymentLedger;
use crate::model::{Outcome, Payment, Provider};
use crate::providers::{ProviderStatus, StatusSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    AlreadyTerminal,
    Confirmed,
    Cancelled,
    /// Provider never heard of the payment and it aged out
    Expired,
    StillPending,
    /// Provider reports a different amount; nothing applied
    AmountMismatch,
    /// No status source for this payment's provider
    NoSource,
}

impl ReconcileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::AlreadyTerminal => "already_terminal",
            ReconcileAction::Confirmed => "confirmed",
            ReconcileAction::Cancelled => "cancelled",
            ReconcileAction::Expired => "expired",
            ReconcileAction::StillPending => "still_pending",
            ReconcileAction::AmountMismatch => "amount_mismatch",
            ReconcileAction::NoSource => "no_source",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub payment: Payment,
    pub action: ReconcileAction,
}

/// Summary of a scheduled sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub confirmed: usize,
    pub cancelled: usize,
    pub expired: usize,
    pub pending: usize,
    pub mismatched: usize,
    pub errors: usize,
}

impl ReconcileSummary {
    fn record(&mut self, action: ReconcileAction) {
        self.checked += 1;
        match action {
            ReconcileAction::Confirmed => self.confirmed += 1,
            ReconcileAction::Cancelled => self.cancelled += 1,
            ReconcileAction::Expired => self.expired += 1,
            ReconcileAction::AmountMismatch => self.mismatched += 1,
            ReconcileAction::StillPending | ReconcileAction::NoSource => self.pending += 1,
            ReconcileAction::AlreadyTerminal => {}
        }
    }
}

pub struct ReconciliationPoller {
    ledger: Arc<PaymentLedger>,
    sources: HashMap<Provider, Arc<dyn StatusSource>>,
    config: ReconcileConfig,
}

impl ReconciliationPoller {
    pub fn new(ledger: Arc<PaymentLedger>, config: ReconcileConfig) -> Self {
        Self {
            ledger,
            sources: HashMap::new(),
            config,
        }
    }

    pub fn with_source(mut self, provider: Provider, source: Arc<dyn StatusSource>) -> Self {
        self.sources.insert(provider, source);
        self
    }

    /// Ask the provider about one payment and apply what it says.
    pub async fn reconcile(&self, payment_id: Uuid) -> BillingResult<Reconciliation> {
        let payment = self.ledger.payment(payment_id).await?;
        if payment.status.is_terminal() {
            return Ok(Reconciliation {
                payment,
                action: ReconcileAction::AlreadyTerminal,
            });
        }

        let Some(source) = self.sources.get(&payment.provider) else {
            tracing::debug!(
                payment_id = %payment_id,
                provider = %payment.provider,
                "No status source for provider"
            );
            return Ok(Reconciliation {
                payment,
                action: ReconcileAction::NoSource,
            });
        };

        let status = source.fetch_status(&payment).await?;
        tracing::debug!(payment_id = %payment_id, status = ?status, "Provider status fetched");

        let (outcome, provider_ref, action) = match status {
            ProviderStatus::Paid {
                provider_ref,
                amount,
            } => {
                if let Some(reported) = amount.filter(|a| *a != payment.amount) {
                    tracing::warn!(
                        payment_id = %payment_id,
                        expected = payment.amount,
                        reported = reported,
                        "Provider reports a different amount, not applying"
                    );
                    record_best_effort(
                        self.ledger.audit(),
                        PaymentEventBuilder::new(PaymentEventType::AmountMismatch)
                            .payment(payment_id)
                            .provider(payment.provider)
                            .data(json!({
                                "expected": payment.amount,
                                "received": reported,
                                "source": "reconciliation",
                            })),
                    )
                    .await;
                    return Ok(Reconciliation {
                        payment,
                        action: ReconcileAction::AmountMismatch,
                    });
                }
                (Outcome::Confirm, provider_ref, ReconcileAction::Confirmed)
            }
            ProviderStatus::Failed { provider_ref } => {
                (Outcome::Cancel, provider_ref, ReconcileAction::Cancelled)
            }
            ProviderStatus::Pending => {
                return Ok(Reconciliation {
                    payment,
                    action: ReconcileAction::StillPending,
                });
            }
            ProviderStatus::Unknown => {
                if !self.is_expired(&payment, OffsetDateTime::now_utc()) {
                    return Ok(Reconciliation {
                        payment,
                        action: ReconcileAction::StillPending,
                    });
                }
                (Outcome::Cancel, None, ReconcileAction::Expired)
            }
        };

        let applied = self
            .ledger
            .apply_outcome(payment_id, outcome, provider_ref.as_deref(), None)
            .await?;
        if !applied.changed {
            // A webhook got there first
            return Ok(Reconciliation {
                payment: applied.payment,
                action: ReconcileAction::AlreadyTerminal,
            });
        }

        tracing::info!(
            payment_id = %payment_id,
            provider = %applied.payment.provider,
            action = action.as_str(),
            "Reconciliation applied"
        );
        record_best_effort(
            self.ledger.audit(),
            PaymentEventBuilder::new(PaymentEventType::ReconciliationApplied)
                .payment(payment_id)
                .invoice(applied.payment.invoice_id)
                .provider(applied.payment.provider)
                .data(json!({ "action": action.as_str() })),
        )
        .await;

        Ok(Reconciliation {
            payment: applied.payment,
            action,
        })
    }

    /// Reconcile online payments that have been pending longer than `stale_after`.
    pub async fn reconcile_stale(&self) -> BillingResult<ReconcileSummary> {
        let cutoff = OffsetDateTime::now_utc() - self.config.stale_after;
        let stale = self
            .ledger
            .store()
            .stale_pending(cutoff, self.config.batch_size)
            .await?;

        let mut summary = ReconcileSummary::default();
        for payment in stale {
            match self.reconcile(payment.id).await {
                Ok(result) => summary.record(result.action),
                Err(e) => {
                    summary.checked += 1;
                    summary.errors += 1;
                    tracing::warn!(
                        payment_id = %payment.id,
                        provider = %payment.provider,
                        error = %e,
                        "Failed to reconcile payment"
                    );
                }
            }
        }
        Ok(summary)
    }

    fn is_expired(&self, payment: &Payment, now: OffsetDateTime) -> bool {
        let Some(expire_after) = self.config.expire_unknown_after else {
            return false;
        };
        let age = (now - payment.created_at).whole_seconds();
        i64::try_from(expire_after.as_secs()).is_ok_and(|limit| age >= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use crate::events::MemoryAuditSink;
    use crate::model::{Invoice, InvoiceStatus, PaymentStatus};
    use crate::store::{InMemoryPaymentStore, PaymentStore};
    use async_trait::async_trait;
    use std::time::Duration;
    use time::macros::date;
    use tokio::sync::Mutex;

    struct FixedStatus(Mutex<Option<ProviderStatus>>);

    #[async_trait]
    impl StatusSource for FixedStatus {
        async fn fetch_status(&self, _payment: &Payment) -> BillingResult<ProviderStatus> {
            self.0
                .lock()
                .await
                .clone()
                .ok_or(BillingError::ProviderTimeout)
        }
    }

    async fn setup(
        status: Option<ProviderStatus>,
        config: ReconcileConfig,
    ) -> (ReconciliationPoller, InMemoryPaymentStore, Arc<PaymentLedger>, Invoice) {
        let store = InMemoryPaymentStore::new();
        let invoice = Invoice {
            id: Uuid::new_v4(),
            contract_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            amount: 90_000,
            due_date: date!(2026 - 11 - 01),
            status: InvoiceStatus::Pending,
        };
        store.insert_invoice(invoice.clone()).await;
        let ledger = Arc::new(PaymentLedger::new(
            Arc::new(store.clone()),
            Arc::new(MemoryAuditSink::new()),
        ));
        let poller = ReconciliationPoller::new(Arc::clone(&ledger), config).with_source(
            Provider::HostedCheckout,
            Arc::new(FixedStatus(Mutex::new(status))),
        );
        (poller, store, ledger, invoice)
    }

    #[tokio::test]
    async fn test_paid_status_confirms() {
        let (poller, store, ledger, invoice) = setup(
            Some(ProviderStatus::Paid {
                provider_ref: Some("chk_1".into()),
                amount: Some(90_000),
            }),
            ReconcileConfig::default(),
        )
        .await;
        let payment = ledger
            .open_intent(invoice.id, Provider::HostedCheckout)
            .await
            .unwrap();

        let result = poller.reconcile(payment.id).await.unwrap();
        assert_eq!(result.action, ReconcileAction::Confirmed);
        assert_eq!(
            store.invoice(invoice.id).await.unwrap().unwrap().status,
            InvoiceStatus::Paid
        );

        let again = poller.reconcile(payment.id).await.unwrap();
        assert_eq!(again.action, ReconcileAction::AlreadyTerminal);
    }

    #[tokio::test]
    async fn test_amount_disagreement_is_not_applied() {
        let (poller, _store, ledger, invoice) = setup(
            Some(ProviderStatus::Paid {
                provider_ref: None,
                amount: Some(1),
            }),
            ReconcileConfig::default(),
        )
        .await;
        let payment = ledger
            .open_intent(invoice.id, Provider::HostedCheckout)
            .await
            .unwrap();

        let result = poller.reconcile(payment.id).await.unwrap();
        assert_eq!(result.action, ReconcileAction::AmountMismatch);
        assert_eq!(result.payment.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_payment_expires_after_threshold() {
        let (poller, store, ledger, invoice) = setup(
            Some(ProviderStatus::Unknown),
            ReconcileConfig {
                expire_unknown_after: Some(Duration::from_secs(3600)),
                ..ReconcileConfig::default()
            },
        )
        .await;
        let payment = ledger
            .open_intent(invoice.id, Provider::HostedCheckout)
            .await
            .unwrap();

        let fresh = poller.reconcile(payment.id).await.unwrap();
        assert_eq!(fresh.action, ReconcileAction::StillPending);

        let mut old = store.payment(payment.id).await.unwrap().unwrap();
        old.created_at -= time::Duration::hours(2);
        store.seed_payment(old).await;

        let expired = poller.reconcile(payment.id).await.unwrap();
        assert_eq!(expired.action, ReconcileAction::Expired);
        assert_eq!(expired.payment.status, PaymentStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_no_source_for_provider() {
        let (poller, _store, ledger, invoice) =
            setup(Some(ProviderStatus::Pending), ReconcileConfig::default()).await;
        let payment = ledger.open_intent(invoice.id, Provider::TwoPhase).await.unwrap();

        let result = poller.reconcile(payment.id).await.unwrap();
        assert_eq!(result.action, ReconcileAction::NoSource);
    }

    #[tokio::test]
    async fn test_stale_sweep_counts_errors() {
        let (poller, store, ledger, invoice) = setup(
            None,
            ReconcileConfig {
                stale_after: Duration::from_secs(60),
                ..ReconcileConfig::default()
            },
        )
        .await;
        let payment = ledger
            .open_intent(invoice.id, Provider::HostedCheckout)
            .await
            .unwrap();
        let mut old = store.payment(payment.id).await.unwrap().unwrap();
        old.created_at -= time::Duration::minutes(30);
        store.seed_payment(old).await;

        let summary = poller.reconcile_stale().await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.errors, 1);
    }
}
