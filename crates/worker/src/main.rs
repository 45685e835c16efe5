//! Rentline Background Worker
//!
//! Handles scheduled jobs including:
//! - Stale payment reconciliation against providers (every 5 minutes)
//! - Overdue invoice marking (daily at 00:05 UTC)
//! - Payment ledger invariant checks (hourly)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rentline_billing::{
    BillingService, InvariantCheckSummary, InvariantChecker, PaymentStore, ReconcileSummary,
    ViolationSeverity,
};
use rentline_shared::{create_pool_with, PoolSettings};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Log results of a reconciliation sweep
fn log_reconcile_summary(summary: &ReconcileSummary) {
    if summary.checked == 0 {
        info!("No stale pending payments");
        return;
    }

    info!(
        checked = summary.checked,
        confirmed = summary.confirmed,
        cancelled = summary.cancelled,
        expired = summary.expired,
        pending = summary.pending,
        mismatched = summary.mismatched,
        errors = summary.errors,
        "Reconciliation sweep complete"
    );
    if summary.mismatched > 0 {
        warn!(
            mismatched = summary.mismatched,
            "Provider amounts disagree with payments; manual review needed"
        );
    }
}

/// Log results of an invariant run, one line per violation
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "All payment invariants hold");
        return;
    }

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                entity_ids = ?violation.entity_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                entity_ids = ?violation.entity_ids,
                "{}",
                violation.description
            ),
        }
    }
    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Payment invariant check found violations"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Rentline Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool_with(
        &database_url,
        &PoolSettings {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        },
    )
    .await?;

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Misconfigured providers; keep the process alive so it is visible
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Reconcile stale pending payments (every 5 minutes)
    let reconcile_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = reconcile_billing.clone();
            Box::pin(async move {
                info!("Running stale payment reconciliation");
                match billing.reconciler.reconcile_stale().await {
                    Ok(summary) => log_reconcile_summary(&summary),
                    Err(e) => error!(error = %e, "Stale payment reconciliation failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stale payment reconciliation (every 5 minutes)");

    // Job 2: Mark overdue invoices (daily at 00:05 UTC)
    let overdue_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 5 0 * * *", move |_uuid, _l| {
            let billing = overdue_billing.clone();
            Box::pin(async move {
                let today = OffsetDateTime::now_utc().date();
                info!(today = %today, "Running overdue invoice check");
                match billing.ledger.store().mark_overdue(today).await {
                    Ok(count) => info!(marked = count, "Overdue invoice check complete"),
                    Err(e) => error!(error = %e, "Overdue invoice check failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Overdue invoice check (daily at 00:05 UTC)");

    // Job 3: Payment invariant checks (hourly)
    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 30 * * * *", move |_uuid, _l| {
            let checker = InvariantChecker::new(invariant_pool.clone());
            Box::pin(async move {
                info!("Running payment invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Payment invariant checks failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Payment invariant checks (hourly at :30)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("30 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Rentline Worker started successfully with {} scheduled jobs", 4);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
