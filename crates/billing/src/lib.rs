// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries provider response text
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Rentline Billing Module
//!
//! Payment intents, provider callbacks and reconciliation for rent invoices.
//!
//! ## Features
//!
//! - **Intents**: Open a pending payment against an invoice and hand back a pay URL
//! - **Two-phase provider**: Prepare/complete merchant protocol with MD5 signed forms
//! - **Hosted checkout**: Redirect checkout with HMAC signed JSON webhooks
//! - **Ledger**: Idempotent, locked payment and invoice state transitions
//! - **Reconciliation**: Pull provider status for payments whose callbacks went missing
//! - **Offline payments**: Collector-recorded cash and bank transfers
//! - **Invariants**: Consistency checks over invoices, payments and balances

pub mod config;
pub mod error;
pub mod events;
pub mod intent;
pub mod invariants;
pub mod ledger;
pub mod model;
pub mod providers;
pub mod reconcile;
pub mod signature;
pub mod store;


use std::sync::Arc;

// Configuration
pub use config::{BillingConfig, HostedCheckoutConfig, ReconcileConfig, TwoPhaseConfig};

// Errors
pub use error::{BillingError, BillingResult, ErrorCode};

// Domain model
pub use model::{
    Balance, EventOutcome, InternalEvent, Invoice, InvoiceStatus, Outcome, Payment,
    PaymentMethod, PaymentStatus, Phase, Provider,
};

// Storage
pub use store::{InMemoryPaymentStore, LedgerTx, PaymentStore, PgPaymentStore};

// Ledger
pub use ledger::{Applied, PaymentLedger, Reservation};

// Intents
pub use intent::{IntentIssuer, PaymentIntent};

// Providers
pub use providers::{
    HostedCheckoutAdapter, HostedCheckoutClient, HostedWebhookReply, ProviderAdapter,
    ProviderStatus, RawMessage, StatusSource, TwoPhaseAction, TwoPhaseAdapter, TwoPhaseClient,
    TwoPhaseReply, HOSTED_SIGNATURE_HEADER,
};

// Reconciliation
pub use reconcile::{ReconcileAction, ReconcileSummary, Reconciliation, ReconciliationPoller};

// Invariants
pub use invariants::{
    invoice_coverage_violation, InvariantCheckSummary, InvariantChecker, InvariantViolation,
    ViolationSeverity,
};

// Audit events
pub use events::{
    AuditSink, MemoryAuditSink, PaymentEvent, PaymentEventBuilder, PaymentEventType, PgAuditSink,
};

use sqlx::PgPool;

/// Main billing service that combines all payment functionality
pub struct BillingService {
    pub ledger: Arc<PaymentLedger>,
    pub intents: IntentIssuer,
    pub two_phase: Option<TwoPhaseAdapter>,
    pub hosted: Option<HostedCheckoutAdapter>,
    pub reconciler: ReconciliationPoller,
}

impl BillingService {
    /// Create a new billing service from environment variables, backed by Postgres
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Self::new(
            config,
            Arc::new(PgPaymentStore::new(pool.clone())),
            Arc::new(PgAuditSink::new(pool)),
        )
    }

    /// Create a new billing service with explicit config and storage
    pub fn new(
        config: BillingConfig,
        store: Arc<dyn PaymentStore>,
        audit: Arc<dyn AuditSink>,
    ) -> BillingResult<Self> {
        let ledger = Arc::new(PaymentLedger::new(store, audit));
        let mut reconciler = ReconciliationPoller::new(ledger.clone(), config.reconcile.clone());

        let two_phase = match &config.two_phase {
            Some(two_phase_config) => {
                let client = TwoPhaseClient::new(two_phase_config.clone(), &config.reconcile)?;
                reconciler = reconciler.with_source(Provider::TwoPhase, Arc::new(client));
                Some(TwoPhaseAdapter::new(two_phase_config.clone(), ledger.clone()))
            }
            None => None,
        };

        let (hosted, hosted_client) = match &config.hosted_checkout {
            Some(hosted_config) => {
                let client = HostedCheckoutClient::new(hosted_config.clone(), &config.reconcile)?;
                reconciler =
                    reconciler.with_source(Provider::HostedCheckout, Arc::new(client.clone()));
                (
                    Some(HostedCheckoutAdapter::new(hosted_config.clone(), ledger.clone())),
                    Some(client),
                )
            }
            None => (None, None),
        };

        let intents = IntentIssuer::new(ledger.clone(), config.two_phase.clone(), hosted_client);

        Ok(Self {
            ledger,
            intents,
            two_phase,
            hosted,
            reconciler,
        })
    }

    /// Service over in-memory storage, for tests and local development
    pub fn in_memory(config: BillingConfig) -> BillingResult<(Self, InMemoryPaymentStore)> {
        let store = InMemoryPaymentStore::new();
        let service = Self::new(
            config,
            Arc::new(store.clone()),
            Arc::new(MemoryAuditSink::new()),
        )?;
        Ok((service, store))
    }
}
