//! Payment intent creation
//!
//! An intent is a pending online payment for the full invoice amount plus
//! whatever the tenant needs to go and pay it.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::config::TwoPhaseConfig;
use crate::error::{BillingError, BillingResult};
use crate::ledger::PaymentLedger;
use crate::model::{Outcome, Provider};
use crate::providers::HostedCheckoutClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentIntent {
    pub payment_id: Uuid,
    pub provider: Provider,
    pub amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pay_url: Option<String>,
}

pub struct IntentIssuer {
    ledger: Arc<PaymentLedger>,
    two_phase: Option<TwoPhaseConfig>,
    hosted: Option<HostedCheckoutClient>,
}

impl IntentIssuer {
    pub fn new(
        ledger: Arc<PaymentLedger>,
        two_phase: Option<TwoPhaseConfig>,
        hosted: Option<HostedCheckoutClient>,
    ) -> Self {
        Self {
            ledger,
            two_phase,
            hosted,
        }
    }

    pub async fn create_intent(
        &self,
        invoice_id: Uuid,
        provider: Provider,
    ) -> BillingResult<PaymentIntent> {
        match provider {
            Provider::TwoPhase => {
                let config = self
                    .two_phase
                    .as_ref()
                    .ok_or(BillingError::ProviderNotConfigured(provider))?;
                let payment = self.ledger.open_intent(invoice_id, provider).await?;
                let pay_url = two_phase_pay_url(config, payment.id, payment.amount)?;
                Ok(PaymentIntent {
                    payment_id: payment.id,
                    provider,
                    amount: payment.amount,
                    pay_url,
                })
            }
            Provider::HostedCheckout => {
                let client = self
                    .hosted
                    .as_ref()
                    .ok_or(BillingError::ProviderNotConfigured(provider))?;
                let payment = self.ledger.open_intent(invoice_id, provider).await?;

                let checkout = match client.create_checkout(&payment).await {
                    Ok(checkout) => checkout,
                    Err(e) => {
                        tracing::warn!(
                            payment_id = %payment.id,
                            error = %e,
                            "Checkout creation failed, cancelling intent"
                        );
                        if let Err(cancel_err) = self
                            .ledger
                            .apply_outcome(payment.id, Outcome::Cancel, None, None)
                            .await
                        {
                            tracing::error!(
                                payment_id = %payment.id,
                                error = %cancel_err,
                                "Failed to cancel intent after checkout error"
                            );
                        }
                        return Err(e);
                    }
                };

                if let Err(e) = self
                    .ledger
                    .attach_provider_ref(payment.id, &checkout.id)
                    .await
                {
                    // Still reachable by merchant ref from webhooks and the poller.
                    tracing::error!(
                        payment_id = %payment.id,
                        checkout_id = %checkout.id,
                        error = %e,
                        "Checkout created but its id could not be stored, intent left pending"
                    );
                    return Err(e);
                }
                Ok(PaymentIntent {
                    payment_id: payment.id,
                    provider,
                    amount: payment.amount,
                    pay_url: Some(checkout.url),
                })
            }
            Provider::Offline | Provider::None => Err(BillingError::UnsupportedProvider(provider)),
        }
    }
}

/// Pay page link for the two-phase provider, when a pay page is configured.
fn two_phase_pay_url(
    config: &TwoPhaseConfig,
    payment_id: Uuid,
    amount: i64,
) -> BillingResult<Option<String>> {
    let Some(base) = &config.pay_url else {
        return Ok(None);
    };

    let payment_ref = payment_id.to_string();
    let amount = amount.to_string();
    let mut params = vec![
        ("service_id", config.service_id.as_str()),
        ("merchant_id", config.merchant_id.as_str()),
        ("amount", amount.as_str()),
        ("transaction_param", payment_ref.as_str()),
    ];
    if let Some(return_url) = &config.return_url {
        params.push(("return_url", return_url.as_str()));
    }

    let url = reqwest::Url::parse_with_params(base, &params)
        .map_err(|e| BillingError::Config(format!("invalid TWO_PHASE_PAY_URL: {}", e)))?;
    Ok(Some(url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostedCheckoutConfig, ReconcileConfig};
    use crate::events::MemoryAuditSink;
    use crate::model::{Invoice, InvoiceStatus, Payment, PaymentStatus};
    use crate::store::{InMemoryPaymentStore, PaymentStore};
    use std::time::Duration;
    use time::macros::date;

    fn two_phase_config(pay_url: Option<&str>) -> TwoPhaseConfig {
        TwoPhaseConfig {
            service_id: "77".into(),
            merchant_id: "m-1".into(),
            merchant_user_id: "u-1".into(),
            secret_key: "s".into(),
            api_base: "http://localhost".into(),
            pay_url: pay_url.map(str::to_string),
            return_url: None,
        }
    }

    async fn setup(
        two_phase: Option<TwoPhaseConfig>,
        hosted: Option<HostedCheckoutClient>,
    ) -> (IntentIssuer, InMemoryPaymentStore, Invoice) {
        let store = InMemoryPaymentStore::new();
        let invoice = Invoice {
            id: Uuid::new_v4(),
            contract_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            amount: 120_000,
            due_date: date!(2026 - 11 - 01),
            status: InvoiceStatus::Pending,
        };
        store.insert_invoice(invoice.clone()).await;
        let ledger = Arc::new(PaymentLedger::new(
            Arc::new(store.clone()),
            Arc::new(MemoryAuditSink::new()),
        ));
        (IntentIssuer::new(ledger, two_phase, hosted), store, invoice)
    }

    #[tokio::test]
    async fn test_two_phase_intent_carries_pay_url() {
        let (issuer, _store, invoice) =
            setup(Some(two_phase_config(Some("https://pay.test/services/pay"))), None).await;

        let intent = issuer
            .create_intent(invoice.id, Provider::TwoPhase)
            .await
            .unwrap();

        assert_eq!(intent.amount, 120_000);
        let url = intent.pay_url.unwrap();
        assert!(url.starts_with("https://pay.test/services/pay?service_id=77"));
        assert!(url.contains(&format!("transaction_param={}", intent.payment_id)));
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_rejected() {
        let (issuer, store, invoice) = setup(None, None).await;
        assert!(matches!(
            issuer.create_intent(invoice.id, Provider::HostedCheckout).await,
            Err(BillingError::ProviderNotConfigured(Provider::HostedCheckout))
        ));
        assert!(store.payments().await.is_empty());
    }

    #[tokio::test]
    async fn test_paid_invoice_is_not_payable() {
        let (issuer, store, mut invoice) = setup(Some(two_phase_config(None)), None).await;
        invoice.status = InvoiceStatus::Paid;
        store.insert_invoice(invoice.clone()).await;

        assert!(matches!(
            issuer.create_intent(invoice.id, Provider::TwoPhase).await,
            Err(BillingError::InvoiceNotPayable { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_checkout_cancels_intent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/checkouts")
            .with_status(400)
            .with_body(r#"{"error":"bad amount"}"#)
            .create_async()
            .await;
        let client = HostedCheckoutClient::new(
            HostedCheckoutConfig {
                api_base: server.url(),
                api_key: "sk".into(),
                webhook_secret: None,
                return_url: "https://app.test/return".into(),
            },
            &ReconcileConfig {
                max_retries: 0,
                retry_base_delay: Duration::from_millis(1),
                ..ReconcileConfig::default()
            },
        )
        .unwrap();
        let (issuer, store, invoice) = setup(None, Some(client)).await;

        let result = issuer
            .create_intent(invoice.id, Provider::HostedCheckout)
            .await;
        assert!(matches!(result, Err(BillingError::ProviderRejected(_))));

        let payments = store.payments_for_invoice(invoice.id).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unstorable_checkout_id_leaves_intent_pending() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/checkouts")
            .with_status(200)
            .with_body(r#"{"id":"chk_taken","url":"https://pay.test/chk_taken"}"#)
            .create_async()
            .await;
        let client = HostedCheckoutClient::new(
            HostedCheckoutConfig {
                api_base: server.url(),
                api_key: "sk".into(),
                webhook_secret: None,
                return_url: "https://app.test/return".into(),
            },
            &ReconcileConfig {
                max_retries: 0,
                retry_base_delay: Duration::from_millis(1),
                ..ReconcileConfig::default()
            },
        )
        .unwrap();
        let (issuer, store, invoice) = setup(None, Some(client)).await;

        let mut other_invoice = invoice.clone();
        other_invoice.id = Uuid::new_v4();
        let mut holder = Payment::intent(
            &other_invoice,
            Provider::HostedCheckout,
            time::OffsetDateTime::now_utc(),
        );
        holder.provider_payment_ref = Some("chk_taken".into());
        store.seed_payment(holder).await;

        let result = issuer
            .create_intent(invoice.id, Provider::HostedCheckout)
            .await;
        assert!(matches!(result, Err(BillingError::Database(_))));

        let payments = store.payments_for_invoice(invoice.id).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Pending);
        assert!(payments[0].provider_payment_ref.is_none());
    }
}
