//! HTTP routes

mod payments;
mod webhooks;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Provider callbacks
        .route(
            "/webhooks/two-phase/prepare",
            post(webhooks::two_phase_prepare),
        )
        .route(
            "/webhooks/two-phase/complete",
            post(webhooks::two_phase_complete),
        )
        .route("/webhooks/hosted-checkout", post(webhooks::hosted_checkout))
        // Payments
        .route("/payments/intents", post(payments::create_intent))
        .route("/payments/{id}", get(payments::get_payment))
        .route("/payments/{id}/refresh", post(payments::refresh_payment))
        // Invoices
        .route("/invoices/{id}", get(payments::get_invoice))
        .route(
            "/invoices/{id}/offline-payments",
            post(payments::record_offline_payment),
        )
        // Balances
        .route("/tenants/{id}/balance", get(payments::get_balance))
        .route(
            "/tenants/{id}/balance/rebuild",
            post(payments::rebuild_balance),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let database = match &state.pool {
        Some(pool) => match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => "ok",
            Err(e) => {
                tracing::error!(error = %e, "Health check database ping failed");
                "unavailable"
            }
        },
        None => "memory",
    };

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "database": database,
        "providers": {
            "two_phase": state.billing.two_phase.is_some(),
            "hosted_checkout": state.billing.hosted.is_some(),
        }
    }))
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        Router,
    };
    use rentline_billing::{
        signature::{self, DigestAlgorithm, SignedPart},
        BillingConfig, BillingService, HostedCheckoutConfig, InMemoryPaymentStore, Invoice,
        InvoiceStatus, ReconcileConfig, TwoPhaseConfig,
    };
    use serde_json::Value;
    use time::macros::date;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::create_router;
    use crate::state::AppState;

    pub const TWO_PHASE_SECRET: &str = "api-two-phase-secret";
    pub const WEBHOOK_SECRET: &str = "whsec_api";

    pub struct TestApp {
        pub router: Router,
        pub store: InMemoryPaymentStore,
        pub invoice: Invoice,
    }

    pub fn full_config() -> BillingConfig {
        BillingConfig {
            two_phase: Some(TwoPhaseConfig {
                service_id: "77".into(),
                merchant_id: "m-1".into(),
                merchant_user_id: "u-1".into(),
                secret_key: TWO_PHASE_SECRET.into(),
                api_base: "http://127.0.0.1:9".into(),
                pay_url: Some("https://pay.test/services/pay".into()),
                return_url: None,
            }),
            hosted_checkout: Some(HostedCheckoutConfig {
                api_base: "http://127.0.0.1:9".into(),
                api_key: "sk_api".into(),
                webhook_secret: Some(WEBHOOK_SECRET.into()),
                return_url: "https://app.test/return".into(),
            }),
            reconcile: ReconcileConfig::default(),
        }
    }

    pub async fn app_with(config: BillingConfig) -> TestApp {
        let (service, store) = BillingService::in_memory(config).unwrap();
        let invoice = Invoice {
            id: Uuid::new_v4(),
            contract_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            amount: 100_000,
            due_date: date!(2026 - 11 - 01),
            status: InvoiceStatus::Pending,
        };
        store.insert_invoice(invoice.clone()).await;
        TestApp {
            router: create_router(AppState::new(service, None)),
            store,
            invoice,
        }
    }

    pub async fn app() -> TestApp {
        app_with(full_config()).await
    }

    pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    pub fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    /// Signed two-phase form; complete when `prepare_ref` is given.
    pub fn two_phase_form(
        txn: &str,
        merchant_ref: &str,
        prepare_ref: Option<&str>,
        amount: &str,
    ) -> String {
        let action = if prepare_ref.is_some() { "1" } else { "0" };
        let sign_time = "2026-10-19 12:00:00";
        let mut parts = vec![
            SignedPart::field("provider_txn_id", txn),
            SignedPart::field("service_id", "77"),
            SignedPart::Secret,
            SignedPart::field("merchant_ref", merchant_ref),
        ];
        if let Some(p) = prepare_ref {
            parts.push(SignedPart::field("prepare_ref", p));
        }
        parts.push(SignedPart::field("amount", amount));
        parts.push(SignedPart::field("action", action));
        parts.push(SignedPart::field("sign_time", sign_time));
        let sign = signature::compute(&parts, TWO_PHASE_SECRET, DigestAlgorithm::Md5);

        let mut fields = vec![
            ("provider_txn_id", txn),
            ("service_id", "77"),
            ("merchant_ref", merchant_ref),
            ("amount", amount),
            ("action", action),
            ("error", "0"),
            ("sign_time", sign_time),
        ];
        if let Some(p) = prepare_ref {
            fields.push(("prepare_ref", p));
        }
        fields.push(("sign", sign.as_str()));
        serde_urlencoded::to_string(&fields).unwrap()
    }

    pub fn post_form(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    }

    pub fn sign_webhook(body: &str) -> String {
        signature::compute(
            &[SignedPart::field("body", body)],
            WEBHOOK_SECRET,
            DigestAlgorithm::HmacSha256,
        )
    }
}
