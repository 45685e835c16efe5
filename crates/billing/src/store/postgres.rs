//! Postgres-backed store
//!
//! Row locks come from `SELECT ... FOR UPDATE` inside a single transaction.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::{LedgerTx, PaymentStore};
use crate::error::{BillingError, BillingResult};
use crate::model::{Balance, Invoice, InvoiceStatus, Payment, Provider};

const PAYMENT_COLUMNS: &str = "id, invoice_id, tenant_id, contract_id, provider, method, amount, \
     status, provider_payment_ref, prepare_ref, raw_payload, collector_note, created_at, paid_at";

const INVOICE_COLUMNS: &str = "id, contract_id, tenant_id, amount, due_date, status";

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    invoice_id: Uuid,
    tenant_id: Uuid,
    contract_id: Uuid,
    provider: String,
    method: String,
    amount: i64,
    status: String,
    provider_payment_ref: Option<String>,
    prepare_ref: Option<String>,
    raw_payload: Option<String>,
    collector_note: Option<String>,
    created_at: OffsetDateTime,
    paid_at: Option<OffsetDateTime>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            invoice_id: row.invoice_id,
            tenant_id: row.tenant_id,
            contract_id: row.contract_id,
            provider: row.provider.parse()?,
            method: row.method.parse()?,
            amount: row.amount,
            status: row.status.parse()?,
            provider_payment_ref: row.provider_payment_ref,
            prepare_ref: row.prepare_ref,
            raw_payload: row.raw_payload,
            collector_note: row.collector_note,
            created_at: row.created_at,
            paid_at: row.paid_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    contract_id: Uuid,
    tenant_id: Uuid,
    amount: i64,
    due_date: Date,
    status: String,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = BillingError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        Ok(Invoice {
            id: row.id,
            contract_id: row.contract_id,
            tenant_id: row.tenant_id,
            amount: row.amount,
            due_date: row.due_date,
            status: row.status.parse()?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceRow {
    tenant_id: Uuid,
    invoiced_total: i64,
    paid_total: i64,
    updated_at: OffsetDateTime,
}

impl From<BalanceRow> for Balance {
    fn from(row: BalanceRow) -> Self {
        Balance {
            tenant_id: row.tenant_id,
            invoiced_total: row.invoiced_total,
            paid_total: row.paid_total,
            updated_at: row.updated_at,
        }
    }
}

fn payments_from_rows(rows: Vec<PaymentRow>) -> BillingResult<Vec<Payment>> {
    rows.into_iter().map(Payment::try_from).collect()
}

#[derive(Clone)]
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn invoice(&self, id: Uuid) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE id = $1",
            INVOICE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Invoice::try_from).transpose()
    }

    async fn payment(&self, id: Uuid) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Payment::try_from).transpose()
    }

    async fn payment_by_provider_ref(
        &self,
        provider: Provider,
        provider_ref: &str,
    ) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE provider = $1 AND provider_payment_ref = $2",
            PAYMENT_COLUMNS
        ))
        .bind(provider.as_str())
        .bind(provider_ref)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Payment::try_from).transpose()
    }

    async fn payments_for_invoice(&self, invoice_id: Uuid) -> BillingResult<Vec<Payment>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE invoice_id = $1 ORDER BY created_at",
            PAYMENT_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;

        payments_from_rows(rows)
    }

    async fn stale_pending(
        &self,
        cutoff: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Payment>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM payments
            WHERE status = 'pending'
              AND method = 'online'
              AND created_at < $1
            ORDER BY created_at
            LIMIT $2
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        payments_from_rows(rows)
    }

    async fn balance(&self, tenant_id: Uuid) -> BillingResult<Option<Balance>> {
        let row: Option<BalanceRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, invoiced_total, paid_total, updated_at
            FROM tenant_balances
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Balance::from))
    }

    async fn mark_overdue(&self, today: Date) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'overdue', updated_at = NOW()
            WHERE status = 'pending'
              AND due_date < $1
              AND archived_at IS NULL
            "#,
        )
        .bind(today)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn begin(&self) -> BillingResult<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }
}

struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_payment(&mut self, id: Uuid) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE id = $1 FOR UPDATE",
            PAYMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Payment::try_from).transpose()
    }

    async fn lock_invoice(&mut self, id: Uuid) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE id = $1 FOR UPDATE",
            INVOICE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(Invoice::try_from).transpose()
    }

    async fn payments_for_invoice(&mut self, invoice_id: Uuid) -> BillingResult<Vec<Payment>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE invoice_id = $1 ORDER BY created_at",
            PAYMENT_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_all(&mut *self.tx)
        .await?;

        payments_from_rows(rows)
    }

    async fn insert_payment(&mut self, payment: &Payment) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments
                (id, invoice_id, tenant_id, contract_id, provider, method, amount, status,
                 provider_payment_ref, prepare_ref, raw_payload, collector_note, created_at, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(payment.id)
        .bind(payment.invoice_id)
        .bind(payment.tenant_id)
        .bind(payment.contract_id)
        .bind(payment.provider.as_str())
        .bind(payment.method.as_str())
        .bind(payment.amount)
        .bind(payment.status.as_str())
        .bind(&payment.provider_payment_ref)
        .bind(&payment.prepare_ref)
        .bind(&payment.raw_payload)
        .bind(&payment.collector_note)
        .bind(payment.created_at)
        .bind(payment.paid_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn update_payment(&mut self, payment: &Payment) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $2,
                provider_payment_ref = $3,
                prepare_ref = $4,
                raw_payload = $5,
                paid_at = $6,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(payment.id)
        .bind(payment.status.as_str())
        .bind(&payment.provider_payment_ref)
        .bind(&payment.prepare_ref)
        .bind(&payment.raw_payload)
        .bind(payment.paid_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::PaymentNotFound(payment.id));
        }
        Ok(())
    }

    async fn set_invoice_status(&mut self, id: Uuid, status: InvoiceStatus) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE invoices SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::InvoiceNotFound(id));
        }
        Ok(())
    }

    async fn recompute_balance(&mut self, tenant_id: Uuid) -> BillingResult<Balance> {
        // Serialize recomputes per tenant so the sums below see committed peers.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
            .bind(tenant_id)
            .execute(&mut *self.tx)
            .await?;

        let row: BalanceRow = sqlx::query_as(
            r#"
            INSERT INTO tenant_balances (tenant_id, invoiced_total, paid_total, updated_at)
            SELECT
                $1,
                (SELECT COALESCE(SUM(amount), 0)::BIGINT FROM invoices
                  WHERE tenant_id = $1 AND status <> 'cancelled'),
                (SELECT COALESCE(SUM(amount), 0)::BIGINT FROM payments
                  WHERE tenant_id = $1 AND status = 'confirmed'),
                NOW()
            ON CONFLICT (tenant_id) DO UPDATE SET
                invoiced_total = EXCLUDED.invoiced_total,
                paid_total = EXCLUDED.paid_total,
                updated_at = EXCLUDED.updated_at
            RETURNING tenant_id, invoiced_total, paid_total, updated_at
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(row.into())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
