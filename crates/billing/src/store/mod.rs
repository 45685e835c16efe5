//! Transactional storage for invoices, payments and balances
//!
//! The ledger talks to storage through two traits: `PaymentStore` for plain
//! reads and for opening a unit of work, and `LedgerTx` for the locked
//! read-check-write inside it. A `LedgerTx` that is dropped without
//! `commit` leaves storage exactly as it was.
//!
//! Lock order is always payment, then invoice.

mod memory;
mod postgres;

pub use memory::InMemoryPaymentStore;
pub use postgres::PgPaymentStore;

use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::model::{Balance, Invoice, InvoiceStatus, Payment, Provider};

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn invoice(&self, id: Uuid) -> BillingResult<Option<Invoice>>;

    async fn payment(&self, id: Uuid) -> BillingResult<Option<Payment>>;

    async fn payment_by_provider_ref(
        &self,
        provider: Provider,
        provider_ref: &str,
    ) -> BillingResult<Option<Payment>>;

    async fn payments_for_invoice(&self, invoice_id: Uuid) -> BillingResult<Vec<Payment>>;

    /// Online payments still pending that were created before `cutoff`, oldest first.
    async fn stale_pending(&self, cutoff: OffsetDateTime, limit: i64)
        -> BillingResult<Vec<Payment>>;

    async fn balance(&self, tenant_id: Uuid) -> BillingResult<Option<Balance>>;

    /// Flip unpaid invoices past their due date to overdue. Returns the number changed.
    async fn mark_overdue(&self, today: Date) -> BillingResult<u64>;

    async fn begin(&self) -> BillingResult<Box<dyn LedgerTx>>;
}

/// One atomic unit of work holding row locks until commit or drop.
#[async_trait]
pub trait LedgerTx: Send {
    /// Lock and read a payment row.
    async fn lock_payment(&mut self, id: Uuid) -> BillingResult<Option<Payment>>;

    /// Lock and read an invoice row.
    async fn lock_invoice(&mut self, id: Uuid) -> BillingResult<Option<Invoice>>;

    /// Payments for an invoice as seen by this transaction.
    async fn payments_for_invoice(&mut self, invoice_id: Uuid) -> BillingResult<Vec<Payment>>;

    async fn insert_payment(&mut self, payment: &Payment) -> BillingResult<()>;

    async fn update_payment(&mut self, payment: &Payment) -> BillingResult<()>;

    async fn set_invoice_status(&mut self, id: Uuid, status: InvoiceStatus) -> BillingResult<()>;

    /// Rebuild the cached balance for a tenant from invoices and confirmed payments.
    async fn recompute_balance(&mut self, tenant_id: Uuid) -> BillingResult<Balance>;

    async fn commit(self: Box<Self>) -> BillingResult<()>;
}
