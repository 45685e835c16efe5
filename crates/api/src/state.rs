//! Application state

use std::sync::Arc;

use rentline_billing::BillingService;
use sqlx::PgPool;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    /// Present when backed by Postgres; used by the health check
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(billing: BillingService, pool: Option<PgPool>) -> Self {
        if billing.two_phase.is_some() {
            tracing::info!("Two-phase provider webhooks enabled");
        } else {
            tracing::warn!("Two-phase provider webhooks disabled (not configured)");
        }
        if billing.hosted.is_some() {
            tracing::info!("Hosted checkout webhooks enabled");
        } else {
            tracing::warn!("Hosted checkout webhooks disabled (not configured)");
        }

        Self {
            billing: Arc::new(billing),
            pool,
        }
    }
}
