//! Payment Ledger Invariants
//!
//! Runnable consistency checks over invoices, payments and cached balances.
//! They only read, so the worker can run them on a schedule and operators can
//! run them after an incident or a manual data fix.
//!
//! ## Checks
//!
//! 1. **invoice_paid_matches_payments**: an invoice is paid iff its confirmed
//!    payments cover its amount
//! 2. **confirmed_on_cancelled_invoice**: money landed on a cancelled invoice
//! 3. **balance_matches_ledger**: cached tenant balances agree with a recompute
//! 4. **prepare_has_provider_txn**: every two-phase reservation names its
//!    provider transaction
//! 5. **stale_pending_payments**: online payments pending for over a day

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::model::{confirmed_total, Invoice, InvoiceStatus, Payment};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Invoices, payments or tenants involved
    pub entity_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money is recorded against the wrong state
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Derived data drifted; rebuildable
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// Coverage check for one invoice against its payments.
///
/// Cancelled invoices are exempt; for every other status `paid` must hold
/// exactly when confirmed payments reach the invoice amount.
pub fn invoice_coverage_violation(
    invoice: &Invoice,
    payments: &[Payment],
) -> Option<InvariantViolation> {
    if invoice.status == InvoiceStatus::Cancelled {
        return None;
    }
    let paid = confirmed_total(payments);
    let covered = paid >= invoice.amount;
    if covered == (invoice.status == InvoiceStatus::Paid) {
        return None;
    }

    Some(InvariantViolation {
        invariant: "invoice_paid_matches_payments".to_string(),
        entity_ids: vec![invoice.id],
        description: format!(
            "Invoice is '{}' but confirmed payments total {} of {}",
            invoice.status, paid, invoice.amount
        ),
        context: serde_json::json!({
            "status": invoice.status,
            "amount": invoice.amount,
            "confirmed_total": paid,
        }),
        severity: ViolationSeverity::Critical,
    })
}

#[derive(Debug, sqlx::FromRow)]
struct CoverageRow {
    invoice_id: Uuid,
    status: String,
    amount: i64,
    confirmed_total: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CancelledInvoicePaymentRow {
    invoice_id: Uuid,
    payment_id: Uuid,
    amount: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceDriftRow {
    tenant_id: Uuid,
    cached_invoiced: i64,
    cached_paid: i64,
    actual_invoiced: i64,
    actual_paid: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRefRow {
    payment_id: Uuid,
    invoice_id: Uuid,
    provider: String,
    created_at: OffsetDateTime,
}

/// Service for running payment invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_invoice_paid_matches_payments().await?);
        violations.extend(self.check_confirmed_on_cancelled_invoice().await?);
        violations.extend(self.check_balance_matches_ledger().await?);
        violations.extend(self.check_prepare_has_provider_txn().await?);
        violations.extend(self.check_stale_pending_payments().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: invoice status agrees with confirmed payments
    async fn check_invoice_paid_matches_payments(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CoverageRow> = sqlx::query_as(
            r#"
            SELECT
                i.id AS invoice_id,
                i.status,
                i.amount,
                COALESCE(SUM(p.amount) FILTER (WHERE p.status = 'confirmed'), 0)::BIGINT
                    AS confirmed_total
            FROM invoices i
            LEFT JOIN payments p ON p.invoice_id = i.id
            WHERE i.status <> 'cancelled'
            GROUP BY i.id, i.status, i.amount
            HAVING (i.status = 'paid') <>
                   (COALESCE(SUM(p.amount) FILTER (WHERE p.status = 'confirmed'), 0) >= i.amount)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invoice_paid_matches_payments".to_string(),
                entity_ids: vec![row.invoice_id],
                description: format!(
                    "Invoice is '{}' but confirmed payments total {} of {}",
                    row.status, row.confirmed_total, row.amount
                ),
                context: serde_json::json!({
                    "status": row.status,
                    "amount": row.amount,
                    "confirmed_total": row.confirmed_total,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: no confirmed money on cancelled invoices
    async fn check_confirmed_on_cancelled_invoice(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CancelledInvoicePaymentRow> = sqlx::query_as(
            r#"
            SELECT i.id AS invoice_id, p.id AS payment_id, p.amount
            FROM invoices i
            JOIN payments p ON p.invoice_id = i.id
            WHERE i.status = 'cancelled'
              AND p.status = 'confirmed'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "confirmed_on_cancelled_invoice".to_string(),
                entity_ids: vec![row.invoice_id, row.payment_id],
                description: format!(
                    "Confirmed payment of {} recorded against a cancelled invoice",
                    row.amount
                ),
                context: serde_json::json!({ "amount": row.amount }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: cached balances match a fresh recompute
    async fn check_balance_matches_ledger(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BalanceDriftRow> = sqlx::query_as(
            r#"
            SELECT
                b.tenant_id,
                b.invoiced_total AS cached_invoiced,
                b.paid_total AS cached_paid,
                (SELECT COALESCE(SUM(amount), 0)::BIGINT FROM invoices
                  WHERE tenant_id = b.tenant_id AND status <> 'cancelled') AS actual_invoiced,
                (SELECT COALESCE(SUM(amount), 0)::BIGINT FROM payments
                  WHERE tenant_id = b.tenant_id AND status = 'confirmed') AS actual_paid
            FROM tenant_balances b
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|row| {
                row.cached_invoiced != row.actual_invoiced || row.cached_paid != row.actual_paid
            })
            .map(|row| InvariantViolation {
                invariant: "balance_matches_ledger".to_string(),
                entity_ids: vec![row.tenant_id],
                description: format!(
                    "Cached balance {} differs from ledger balance {}",
                    row.cached_paid - row.cached_invoiced,
                    row.actual_paid - row.actual_invoiced
                ),
                context: serde_json::json!({
                    "cached_invoiced": row.cached_invoiced,
                    "cached_paid": row.cached_paid,
                    "actual_invoiced": row.actual_invoiced,
                    "actual_paid": row.actual_paid,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: prepare references always come with a provider transaction
    async fn check_prepare_has_provider_txn(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaymentRefRow> = sqlx::query_as(
            r#"
            SELECT id AS payment_id, invoice_id, provider, created_at
            FROM payments
            WHERE prepare_ref IS NOT NULL
              AND provider_payment_ref IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "prepare_has_provider_txn".to_string(),
                entity_ids: vec![row.payment_id, row.invoice_id],
                description: "Payment has a prepare reference but no provider transaction"
                    .to_string(),
                context: serde_json::json!({ "provider": row.provider }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: nothing sits pending for more than a day
    ///
    /// Usually means reconciliation is failing for a provider.
    async fn check_stale_pending_payments(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaymentRefRow> = sqlx::query_as(
            r#"
            SELECT id AS payment_id, invoice_id, provider, created_at
            FROM payments
            WHERE status = 'pending'
              AND method = 'online'
              AND created_at < NOW() - INTERVAL '1 day'
            ORDER BY created_at
            LIMIT 100
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stale_pending_payments".to_string(),
                entity_ids: vec![row.payment_id, row.invoice_id],
                description: format!(
                    "{} payment pending since {}",
                    row.provider, row.created_at
                ),
                context: serde_json::json!({ "provider": row.provider }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "invoice_paid_matches_payments" => self.check_invoice_paid_matches_payments().await,
            "confirmed_on_cancelled_invoice" => self.check_confirmed_on_cancelled_invoice().await,
            "balance_matches_ledger" => self.check_balance_matches_ledger().await,
            "prepare_has_provider_txn" => self.check_prepare_has_provider_txn().await,
            "stale_pending_payments" => self.check_stale_pending_payments().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "invoice_paid_matches_payments",
            "confirmed_on_cancelled_invoice",
            "balance_matches_ledger",
            "prepare_has_provider_txn",
            "stale_pending_payments",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PaymentStatus, Provider};
    use time::macros::date;

    fn invoice(status: InvoiceStatus) -> Invoice {
        Invoice {
            id: Uuid::new_v4(),
            contract_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            amount: 100,
            due_date: date!(2026 - 10 - 01),
            status,
        }
    }

    fn confirmed(invoice: &Invoice, amount: i64) -> Payment {
        let mut p = Payment::intent(invoice, Provider::HostedCheckout, OffsetDateTime::now_utc());
        p.amount = amount;
        p.status = PaymentStatus::Confirmed;
        p
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"invoice_paid_matches_payments"));
        assert!(checks.contains(&"balance_matches_ledger"));
    }

    #[test]
    fn test_coverage_holds_for_exact_and_over_payment() {
        let paid = invoice(InvoiceStatus::Paid);
        assert!(invoice_coverage_violation(&paid, &[confirmed(&paid, 100)]).is_none());
        assert!(invoice_coverage_violation(&paid, &[confirmed(&paid, 60), confirmed(&paid, 60)])
            .is_none());
    }

    #[test]
    fn test_coverage_flags_unpaid_but_covered() {
        let pending = invoice(InvoiceStatus::Overdue);
        let violation =
            invoice_coverage_violation(&pending, &[confirmed(&pending, 100)]).unwrap();
        assert_eq!(violation.severity, ViolationSeverity::Critical);
    }

    #[test]
    fn test_coverage_flags_paid_but_short() {
        let paid = invoice(InvoiceStatus::Paid);
        assert!(invoice_coverage_violation(&paid, &[confirmed(&paid, 99)]).is_some());
    }

    #[test]
    fn test_cancelled_invoice_is_exempt() {
        let cancelled = invoice(InvoiceStatus::Cancelled);
        assert!(invoice_coverage_violation(&cancelled, &[confirmed(&cancelled, 100)]).is_none());
    }
}
