//! Payment, invoice and balance endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rentline_billing::{
    invoice_coverage_violation, model::confirmed_total, Balance, Invoice, InvariantViolation,
    Payment, PaymentIntent, PaymentMethod, PaymentStatus, PaymentStore, Provider, ReconcileAction,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateIntentRequest {
    pub invoice_id: Uuid,
    pub provider: Provider,
}

/// Payment as exposed over HTTP; the raw provider payload stays internal.
#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub provider: Provider,
    pub method: PaymentMethod,
    pub amount: i64,
    pub status: PaymentStatus,
    pub provider_payment_ref: Option<String>,
    pub collector_note: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
}

impl From<Payment> for PaymentResponse {
    fn from(p: Payment) -> Self {
        Self {
            id: p.id,
            invoice_id: p.invoice_id,
            tenant_id: p.tenant_id,
            provider: p.provider,
            method: p.method,
            amount: p.amount,
            status: p.status,
            provider_payment_ref: p.provider_payment_ref,
            collector_note: p.collector_note,
            created_at: p.created_at,
            paid_at: p.paid_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub payment_id: Uuid,
    pub status: PaymentStatus,
    pub action: ReconcileAction,
}

#[derive(Debug, Serialize)]
pub struct InvoiceResponse {
    pub invoice: Invoice,
    pub payments: Vec<PaymentResponse>,
    pub paid_total: i64,
    pub outstanding: i64,
    /// Set when the invoice status disagrees with its confirmed payments
    pub coverage_violation: Option<InvariantViolation>,
}

#[derive(Debug, Deserialize)]
pub struct OfflinePaymentRequest {
    pub amount: i64,
    pub collector_note: String,
}

#[derive(Debug, Serialize)]
pub struct OfflinePaymentResponse {
    pub payment: PaymentResponse,
    pub invoice_paid: bool,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub tenant_id: Uuid,
    pub invoiced_total: i64,
    pub paid_total: i64,
    /// Negative means the tenant owes
    pub balance: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<Balance> for BalanceResponse {
    fn from(b: Balance) -> Self {
        Self {
            tenant_id: b.tenant_id,
            invoiced_total: b.invoiced_total,
            paid_total: b.paid_total,
            balance: b.amount(),
            updated_at: b.updated_at,
        }
    }
}

/// POST /payments/intents
pub async fn create_intent(
    State(state): State<AppState>,
    Json(req): Json<CreateIntentRequest>,
) -> ApiResult<(StatusCode, Json<PaymentIntent>)> {
    let intent = state
        .billing
        .intents
        .create_intent(req.invoice_id, req.provider)
        .await?;
    tracing::info!(
        invoice_id = %req.invoice_id,
        payment_id = %intent.payment_id,
        provider = %intent.provider,
        "Payment intent created"
    );
    Ok((StatusCode::CREATED, Json(intent)))
}

/// GET /payments/{id}
pub async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<Json<PaymentResponse>> {
    let payment = state.billing.ledger.payment(payment_id).await?;
    Ok(Json(payment.into()))
}

/// POST /payments/{id}/refresh
pub async fn refresh_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<Json<RefreshResponse>> {
    let result = state.billing.reconciler.reconcile(payment_id).await?;
    Ok(Json(RefreshResponse {
        payment_id,
        status: result.payment.status,
        action: result.action,
    }))
}

/// GET /invoices/{id}
pub async fn get_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<Json<InvoiceResponse>> {
    let invoice = state.billing.ledger.invoice(invoice_id).await?;
    let payments = state
        .billing
        .ledger
        .store()
        .payments_for_invoice(invoice_id)
        .await?;

    let paid_total = confirmed_total(&payments);
    let coverage_violation = invoice_coverage_violation(&invoice, &payments);
    if let Some(violation) = &coverage_violation {
        tracing::warn!(
            invoice_id = %invoice_id,
            description = %violation.description,
            "Invoice status disagrees with confirmed payments"
        );
    }

    Ok(Json(InvoiceResponse {
        outstanding: (invoice.amount - paid_total).max(0),
        paid_total,
        coverage_violation,
        payments: payments.into_iter().map(PaymentResponse::from).collect(),
        invoice,
    }))
}

/// POST /invoices/{id}/offline-payments
pub async fn record_offline_payment(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
    Json(req): Json<OfflinePaymentRequest>,
) -> ApiResult<(StatusCode, Json<OfflinePaymentResponse>)> {
    let note = req.collector_note.trim();
    if note.is_empty() {
        return Err(ApiError::BadRequest("collector_note is required".into()));
    }

    let applied = state
        .billing
        .ledger
        .record_offline_payment(invoice_id, req.amount, note)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(OfflinePaymentResponse {
            invoice_paid: applied.invoice_paid,
            payment: applied.payment.into(),
        }),
    ))
}

/// GET /tenants/{id}/balance
pub async fn get_balance(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<BalanceResponse>> {
    let balance = state
        .billing
        .ledger
        .store()
        .balance(tenant_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No balance for tenant {}", tenant_id)))?;
    Ok(Json(balance.into()))
}

/// POST /tenants/{id}/balance/rebuild
pub async fn rebuild_balance(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<BalanceResponse>> {
    let balance = state.billing.ledger.rebuild_balance(tenant_id).await?;
    tracing::info!(tenant_id = %tenant_id, balance = balance.amount(), "Balance rebuilt");
    Ok(Json(balance.into()))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_create_two_phase_intent() {
        let app = app().await;
        let (status, body) = send(
            &app.router,
            post_json(
                "/payments/intents",
                &json!({ "invoice_id": app.invoice.id, "provider": "two_phase" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["provider"], "two_phase");
        assert_eq!(body["amount"], 100_000);
        assert!(body["pay_url"]
            .as_str()
            .unwrap()
            .starts_with("https://pay.test/services/pay?"));

        // A second pending intent for the same provider is refused
        let (status, _) = send(
            &app.router,
            post_json(
                "/payments/intents",
                &json!({ "invoice_id": app.invoice.id, "provider": "two_phase" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_intent_errors() {
        let app = app().await;
        let (status, _) = send(
            &app.router,
            post_json(
                "/payments/intents",
                &json!({ "invoice_id": Uuid::new_v4(), "provider": "two_phase" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app.router,
            post_json(
                "/payments/intents",
                &json!({ "invoice_id": app.invoice.id, "provider": "offline" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_offline_payment_settles_and_shows_on_invoice() {
        let app = app().await;
        let uri = format!("/invoices/{}/offline-payments", app.invoice.id);

        let (status, body) = send(
            &app.router,
            post_json(&uri, &json!({ "amount": 100_000, "collector_note": "cash at office" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["invoice_paid"], true);
        assert_eq!(body["payment"]["status"], "confirmed");
        assert_eq!(body["payment"]["method"], "offline");

        let (status, invoice) =
            send(&app.router, get(&format!("/invoices/{}", app.invoice.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(invoice["invoice"]["status"], "paid");
        assert_eq!(invoice["paid_total"], 100_000);
        assert_eq!(invoice["outstanding"], 0);
        assert!(invoice["coverage_violation"].is_null());

        let (status, balance) = send(
            &app.router,
            get(&format!("/tenants/{}/balance", app.invoice.tenant_id)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(balance["balance"], 0);
    }

    #[tokio::test]
    async fn test_offline_payment_validation() {
        let app = app().await;
        let uri = format!("/invoices/{}/offline-payments", app.invoice.id);

        let (status, _) = send(
            &app.router,
            post_json(&uri, &json!({ "amount": 100, "collector_note": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app.router,
            post_json(&uri, &json!({ "amount": 0, "collector_note": "cash" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_payment_lookup_and_refresh_of_terminal_payment() {
        let app = app().await;
        let (status, _) = send(&app.router, get(&format!("/payments/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = send(
            &app.router,
            post_json(
                &format!("/invoices/{}/offline-payments", app.invoice.id),
                &json!({ "amount": 40_000, "collector_note": "partial" }),
            ),
        )
        .await;
        let payment_id = body["payment"]["id"].as_str().unwrap().to_string();

        let (status, payment) =
            send(&app.router, get(&format!("/payments/{}", payment_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payment["amount"], 40_000);
        assert!(payment.get("raw_payload").is_none());

        let (status, refresh) = send(
            &app.router,
            post_json(&format!("/payments/{}/refresh", payment_id), &json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(refresh["action"], "already_terminal");
        assert_eq!(refresh["status"], "confirmed");
    }

    #[tokio::test]
    async fn test_balance_missing_then_rebuilt() {
        let app = app().await;
        let uri = format!("/tenants/{}/balance", app.invoice.tenant_id);

        let (status, _) = send(&app.router, get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, balance) =
            send(&app.router, post_json(&format!("{}/rebuild", uri), &json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(balance["invoiced_total"], 100_000);
        assert_eq!(balance["balance"], -100_000);
    }
}
