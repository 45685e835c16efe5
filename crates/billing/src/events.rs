//! Payment audit events
//!
//! Every ledger transition, prepare reservation and rejected callback is
//! recorded here. Audit writes happen after the ledger commits and never
//! roll it back; a failed write is logged and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::model::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentEventType {
    IntentCreated,
    PrepareAccepted,
    PaymentConfirmed,
    PaymentCancelled,
    InvoicePaid,
    OfflinePaymentRecorded,
    DuplicateDelivery,
    SignatureRejected,
    AmountMismatch,
    ReconciliationApplied,
}

impl PaymentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentEventType::IntentCreated => "intent_created",
            PaymentEventType::PrepareAccepted => "prepare_accepted",
            PaymentEventType::PaymentConfirmed => "payment_confirmed",
            PaymentEventType::PaymentCancelled => "payment_cancelled",
            PaymentEventType::InvoicePaid => "invoice_paid",
            PaymentEventType::OfflinePaymentRecorded => "offline_payment_recorded",
            PaymentEventType::DuplicateDelivery => "duplicate_delivery",
            PaymentEventType::SignatureRejected => "signature_rejected",
            PaymentEventType::AmountMismatch => "amount_mismatch",
            PaymentEventType::ReconciliationApplied => "reconciliation_applied",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentEvent {
    pub id: Uuid,
    pub event_type: PaymentEventType,
    pub payment_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub provider: Option<Provider>,
    pub data: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Builder for audit events
pub struct PaymentEventBuilder {
    event: PaymentEvent,
}

impl PaymentEventBuilder {
    pub fn new(event_type: PaymentEventType) -> Self {
        Self {
            event: PaymentEvent {
                id: Uuid::new_v4(),
                event_type,
                payment_id: None,
                invoice_id: None,
                provider: None,
                data: serde_json::Value::Null,
                created_at: OffsetDateTime::now_utc(),
            },
        }
    }

    pub fn payment(mut self, payment_id: Uuid) -> Self {
        self.event.payment_id = Some(payment_id);
        self
    }

    pub fn invoice(mut self, invoice_id: Uuid) -> Self {
        self.event.invoice_id = Some(invoice_id);
        self
    }

    pub fn provider(mut self, provider: Provider) -> Self {
        self.event.provider = Some(provider);
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event.data = data;
        self
    }

    pub fn build(self) -> PaymentEvent {
        self.event
    }
}

/// Destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: PaymentEvent) -> BillingResult<()>;
}

/// Record an event, logging instead of failing.
pub async fn record_best_effort(sink: &dyn AuditSink, builder: PaymentEventBuilder) {
    let event = builder.build();
    let event_type = event.event_type;
    if let Err(e) = sink.record(event).await {
        tracing::warn!(
            event_type = event_type.as_str(),
            error = %e,
            "Failed to record payment audit event"
        );
    }
}

/// Audit sink backed by the `payment_events` table
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, event: PaymentEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_events
                (id, event_type, payment_id, invoice_id, provider, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.event_type.as_str())
        .bind(event.payment_id)
        .bind(event.invoice_id)
        .bind(event.provider.map(|p| p.as_str()))
        .bind(&event.data)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// In-process audit sink for tests and local development
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<RwLock<Vec<PaymentEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<PaymentEvent> {
        self.events.read().await.clone()
    }

    pub async fn count(&self, event_type: PaymentEventType) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: PaymentEvent) -> BillingResult<()> {
        self.events.write().await.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_and_memory_sink() {
        let sink = MemoryAuditSink::new();
        let payment_id = Uuid::new_v4();

        record_best_effort(
            &sink,
            PaymentEventBuilder::new(PaymentEventType::PaymentConfirmed)
                .payment(payment_id)
                .provider(Provider::TwoPhase)
                .data(serde_json::json!({ "amount": 100 })),
        )
        .await;

        let events = sink.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payment_id, Some(payment_id));
        assert_eq!(events[0].provider, Some(Provider::TwoPhase));
        assert_eq!(sink.count(PaymentEventType::PaymentConfirmed).await, 1);
        assert_eq!(sink.count(PaymentEventType::InvoicePaid).await, 0);
    }
}
