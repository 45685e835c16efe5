//! In-process store with the same locking contract as Postgres
//!
//! Row locks are per-key async mutexes held by the transaction until it
//! commits or is dropped. Writes are staged on the transaction and applied
//! under a single write lock at commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use super::{LedgerTx, PaymentStore};
use crate::error::{BillingError, BillingResult};
use crate::model::{
    Balance, Invoice, InvoiceStatus, Payment, PaymentMethod, PaymentStatus, Provider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LockKey {
    Payment(Uuid),
    Invoice(Uuid),
    Tenant(Uuid),
}

#[derive(Default)]
struct MemoryState {
    invoices: HashMap<Uuid, Invoice>,
    payments: HashMap<Uuid, Payment>,
    balances: HashMap<Uuid, Balance>,
}

#[derive(Default)]
struct Inner {
    state: RwLock<MemoryState>,
    locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
    fail_next_invoice_update: AtomicBool,
}

impl Inner {
    async fn row_lock(&self, key: LockKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }
}

/// Payment store kept entirely in memory. Cloning shares the same data.
#[derive(Clone, Default)]
pub struct InMemoryPaymentStore {
    inner: Arc<Inner>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_invoice(&self, invoice: Invoice) {
        self.inner
            .state
            .write()
            .await
            .invoices
            .insert(invoice.id, invoice);
    }

    /// Write a payment row directly, bypassing ledger checks.
    pub async fn seed_payment(&self, payment: Payment) {
        self.inner
            .state
            .write()
            .await
            .payments
            .insert(payment.id, payment);
    }

    /// Make the next invoice status write fail, to exercise rollback paths.
    pub fn fail_next_invoice_update(&self) {
        self.inner
            .fail_next_invoice_update
            .store(true, Ordering::SeqCst);
    }

    /// All committed payments, oldest first.
    pub async fn payments(&self) -> Vec<Payment> {
        let state = self.inner.state.read().await;
        let mut payments: Vec<Payment> = state.payments.values().cloned().collect();
        payments.sort_by_key(|p| p.created_at);
        payments
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn invoice(&self, id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self.inner.state.read().await.invoices.get(&id).cloned())
    }

    async fn payment(&self, id: Uuid) -> BillingResult<Option<Payment>> {
        Ok(self.inner.state.read().await.payments.get(&id).cloned())
    }

    async fn payment_by_provider_ref(
        &self,
        provider: Provider,
        provider_ref: &str,
    ) -> BillingResult<Option<Payment>> {
        let state = self.inner.state.read().await;
        Ok(state
            .payments
            .values()
            .find(|p| {
                p.provider == provider && p.provider_payment_ref.as_deref() == Some(provider_ref)
            })
            .cloned())
    }

    async fn payments_for_invoice(&self, invoice_id: Uuid) -> BillingResult<Vec<Payment>> {
        let state = self.inner.state.read().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.invoice_id == invoice_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn stale_pending(
        &self,
        cutoff: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Payment>> {
        let state = self.inner.state.read().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| {
                p.status == PaymentStatus::Pending
                    && p.method == PaymentMethod::Online
                    && p.created_at < cutoff
            })
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        payments.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(payments)
    }

    async fn balance(&self, tenant_id: Uuid) -> BillingResult<Option<Balance>> {
        Ok(self.inner.state.read().await.balances.get(&tenant_id).cloned())
    }

    async fn mark_overdue(&self, today: Date) -> BillingResult<u64> {
        let is_overdue =
            |i: &Invoice| i.status == InvoiceStatus::Pending && i.due_date < today;
        let candidates: Vec<Uuid> = {
            let state = self.inner.state.read().await;
            state
                .invoices
                .values()
                .filter(|i| is_overdue(i))
                .map(|i| i.id)
                .collect()
        };

        let mut changed = 0;
        for id in candidates {
            // Same row lock a ledger transaction holds; status is re-read under it.
            let _guard = self.inner.row_lock(LockKey::Invoice(id)).await;
            let mut state = self.inner.state.write().await;
            if let Some(invoice) = state.invoices.get_mut(&id).filter(|i| is_overdue(i)) {
                invoice.status = InvoiceStatus::Overdue;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn begin(&self) -> BillingResult<Box<dyn LedgerTx>> {
        Ok(Box::new(MemoryLedgerTx {
            inner: Arc::clone(&self.inner),
            guards: HashMap::new(),
            payments: HashMap::new(),
            invoice_statuses: HashMap::new(),
            balances: HashMap::new(),
        }))
    }
}

struct MemoryLedgerTx {
    inner: Arc<Inner>,
    guards: HashMap<LockKey, OwnedMutexGuard<()>>,
    payments: HashMap<Uuid, Payment>,
    invoice_statuses: HashMap<Uuid, InvoiceStatus>,
    balances: HashMap<Uuid, Balance>,
}

impl MemoryLedgerTx {
    async fn acquire(&mut self, key: LockKey) {
        if self.guards.contains_key(&key) {
            return;
        }
        let guard = self.inner.row_lock(key).await;
        self.guards.insert(key, guard);
    }

    fn staged_invoice(&self, mut invoice: Invoice) -> Invoice {
        if let Some(status) = self.invoice_statuses.get(&invoice.id) {
            invoice.status = *status;
        }
        invoice
    }

    /// Committed payments with this transaction's staged writes laid over them.
    async fn visible_payments(&self) -> HashMap<Uuid, Payment> {
        let state = self.inner.state.read().await;
        let mut merged = state.payments.clone();
        for (id, payment) in &self.payments {
            merged.insert(*id, payment.clone());
        }
        merged
    }

    /// Uniqueness rules enforced by indexes in the Postgres schema.
    fn check_unique(visible: &HashMap<Uuid, Payment>, payment: &Payment) -> BillingResult<()> {
        for other in visible.values().filter(|p| p.id != payment.id) {
            if let (Some(a), Some(b)) = (&other.provider_payment_ref, &payment.provider_payment_ref)
            {
                if a == b && other.provider == payment.provider {
                    return Err(BillingError::Database(format!(
                        "duplicate provider reference '{}' for {}",
                        b, payment.provider
                    )));
                }
            }
            if payment.status == PaymentStatus::Pending
                && payment.method == PaymentMethod::Online
                && other.status == PaymentStatus::Pending
                && other.method == PaymentMethod::Online
                && other.invoice_id == payment.invoice_id
                && other.provider == payment.provider
            {
                return Err(BillingError::Database(format!(
                    "duplicate pending {} payment for invoice {}",
                    payment.provider, payment.invoice_id
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn lock_payment(&mut self, id: Uuid) -> BillingResult<Option<Payment>> {
        self.acquire(LockKey::Payment(id)).await;
        if let Some(staged) = self.payments.get(&id) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.inner.state.read().await.payments.get(&id).cloned())
    }

    async fn lock_invoice(&mut self, id: Uuid) -> BillingResult<Option<Invoice>> {
        self.acquire(LockKey::Invoice(id)).await;
        let invoice = self.inner.state.read().await.invoices.get(&id).cloned();
        Ok(invoice.map(|i| self.staged_invoice(i)))
    }

    async fn payments_for_invoice(&mut self, invoice_id: Uuid) -> BillingResult<Vec<Payment>> {
        let mut payments: Vec<Payment> = self
            .visible_payments()
            .await
            .into_values()
            .filter(|p| p.invoice_id == invoice_id)
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn insert_payment(&mut self, payment: &Payment) -> BillingResult<()> {
        let visible = self.visible_payments().await;
        if visible.contains_key(&payment.id) {
            return Err(BillingError::Database(format!(
                "duplicate payment id {}",
                payment.id
            )));
        }
        Self::check_unique(&visible, payment)?;

        self.acquire(LockKey::Payment(payment.id)).await;
        self.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn update_payment(&mut self, payment: &Payment) -> BillingResult<()> {
        let visible = self.visible_payments().await;
        let Some(current) = visible.get(&payment.id) else {
            return Err(BillingError::PaymentNotFound(payment.id));
        };
        if current.status.is_terminal() && current.status != payment.status {
            return Err(BillingError::Database(format!(
                "payment {} cannot leave terminal status {}",
                payment.id, current.status
            )));
        }
        Self::check_unique(&visible, payment)?;

        self.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn set_invoice_status(&mut self, id: Uuid, status: InvoiceStatus) -> BillingResult<()> {
        if self
            .inner
            .fail_next_invoice_update
            .swap(false, Ordering::SeqCst)
        {
            return Err(BillingError::Database(
                "injected invoice update failure".to_string(),
            ));
        }
        if !self.inner.state.read().await.invoices.contains_key(&id) {
            return Err(BillingError::InvoiceNotFound(id));
        }
        self.invoice_statuses.insert(id, status);
        Ok(())
    }

    async fn recompute_balance(&mut self, tenant_id: Uuid) -> BillingResult<Balance> {
        self.acquire(LockKey::Tenant(tenant_id)).await;

        let invoiced_total: i64 = {
            let state = self.inner.state.read().await;
            state
                .invoices
                .values()
                .filter(|i| i.tenant_id == tenant_id)
                .map(|i| self.staged_invoice(i.clone()))
                .filter(|i| i.status != InvoiceStatus::Cancelled)
                .map(|i| i.amount)
                .sum()
        };
        let paid_total: i64 = self
            .visible_payments()
            .await
            .values()
            .filter(|p| p.tenant_id == tenant_id && p.status == PaymentStatus::Confirmed)
            .map(|p| p.amount)
            .sum();

        let balance = Balance {
            tenant_id,
            invoiced_total,
            paid_total,
            updated_at: OffsetDateTime::now_utc(),
        };
        self.balances.insert(tenant_id, balance.clone());
        Ok(balance)
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let MemoryLedgerTx {
            inner,
            guards,
            payments,
            invoice_statuses,
            balances,
        } = *self;

        {
            let mut state = inner.state.write().await;
            state.payments.extend(payments);
            for (id, status) in invoice_statuses {
                if let Some(invoice) = state.invoices.get_mut(&id) {
                    invoice.status = status;
                }
            }
            state.balances.extend(balances);
        }

        // Row locks are released only after the writes are visible.
        drop(guards);
        Ok(())
    }
}
