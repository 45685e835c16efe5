//! Outbound HTTP clients for provider APIs
//!
//! Every request carries the client timeout from `ReconcileConfig`. Transient
//! failures (timeouts, connection errors, 5xx) are retried with jittered
//! exponential backoff; 4xx answers are not.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use super::{ProviderStatus, StatusSource};
use crate::config::{HostedCheckoutConfig, ReconcileConfig, TwoPhaseConfig};
use crate::error::{BillingError, BillingResult};
use crate::model::Payment;

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: usize,
    base_delay: Duration,
}

impl RetryPolicy {
    fn from_config(config: &ReconcileConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
        }
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, action: F) -> BillingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BillingResult<T>>,
    {
        // from_millis(2) doubles each step; the factor scales the first delay to base_delay
        let factor = u64::try_from(self.base_delay.as_millis() / 2).unwrap_or(u64::MAX);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries);

        RetryIf::spawn(strategy, action, |e: &BillingError| {
            let retry = e.is_transient();
            if retry {
                tracing::debug!(operation = operation, error = %e, "Retrying provider request");
            }
            retry
        })
        .await
    }
}

fn build_http(config: &ReconcileConfig) -> BillingResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Turn a non-success HTTP status into the matching error class.
fn status_error(status: StatusCode, body: &str) -> BillingError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BillingError::Provider(format!("HTTP {}: {}", status, body))
    } else {
        BillingError::ProviderRejected(format!("HTTP {}: {}", status, body))
    }
}

// =============================================================================
// Hosted checkout
// =============================================================================

/// A hosted checkout session the tenant is redirected to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Checkout {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
struct CreateCheckoutRequest<'a> {
    amount: i64,
    merchant_ref: &'a str,
    return_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct CheckoutStatusResponse {
    id: String,
    status: String,
    #[serde(default)]
    amount: Option<i64>,
}

#[derive(Clone)]
pub struct HostedCheckoutClient {
    http: reqwest::Client,
    config: HostedCheckoutConfig,
    retry: RetryPolicy,
}

impl HostedCheckoutClient {
    pub fn new(config: HostedCheckoutConfig, reconcile: &ReconcileConfig) -> BillingResult<Self> {
        Ok(Self {
            http: build_http(reconcile)?,
            config,
            retry: RetryPolicy::from_config(reconcile),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    /// Open a checkout session for a pending payment.
    ///
    /// The payment id doubles as the idempotency key, so a retried request
    /// yields the same session.
    pub async fn create_checkout(&self, payment: &Payment) -> BillingResult<Checkout> {
        let merchant_ref = payment.id.to_string();
        let body = CreateCheckoutRequest {
            amount: payment.amount,
            merchant_ref: &merchant_ref,
            return_url: &self.config.return_url,
        };

        let body = &body;
        let merchant_ref = merchant_ref.as_str();
        let checkout: Checkout = self
            .retry
            .run("create_checkout", move || async move {
                let response = self
                    .http
                    .post(self.url("/v1/checkouts"))
                    .bearer_auth(&self.config.api_key)
                    .header("Idempotency-Key", merchant_ref)
                    .json(body)
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(status_error(status, &text));
                }
                Ok::<_, BillingError>(response.json::<Checkout>().await?)
            })
            .await?;

        tracing::info!(
            payment_id = %payment.id,
            checkout_id = %checkout.id,
            "Hosted checkout created"
        );
        Ok(checkout)
    }

    async fn lookup(&self, path: &str) -> BillingResult<Option<CheckoutStatusResponse>> {
        self.retry
            .run("checkout_status", move || async move {
                let response = self
                    .http
                    .get(self.url(path))
                    .bearer_auth(&self.config.api_key)
                    .send()
                    .await?;

                let status = response.status();
                if status == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(status_error(status, &text));
                }
                Ok::<_, BillingError>(Some(response.json::<CheckoutStatusResponse>().await?))
            })
            .await
    }
}

#[async_trait]
impl StatusSource for HostedCheckoutClient {
    async fn fetch_status(&self, payment: &Payment) -> BillingResult<ProviderStatus> {
        let path = match &payment.provider_payment_ref {
            Some(checkout_id) => format!("/v1/checkouts/{}", checkout_id),
            None => format!("/v1/checkouts/by-merchant-ref/{}", payment.id),
        };

        let Some(checkout) = self.lookup(&path).await? else {
            return Ok(ProviderStatus::Unknown);
        };

        let status = match checkout.status.as_str() {
            "paid" => ProviderStatus::Paid {
                provider_ref: Some(checkout.id),
                amount: checkout.amount,
            },
            "failed" | "expired" | "cancelled" => ProviderStatus::Failed {
                provider_ref: Some(checkout.id),
            },
            "pending" | "open" => ProviderStatus::Pending,
            other => {
                tracing::warn!(
                    payment_id = %payment.id,
                    status = %other,
                    "Unrecognized checkout status, treating as pending"
                );
                ProviderStatus::Pending
            }
        };
        Ok(status)
    }
}

// =============================================================================
// Two-phase merchant API
// =============================================================================

#[derive(Debug, Deserialize)]
struct TwoPhaseStatusResponse {
    error_code: i32,
    #[serde(default)]
    error_note: Option<String>,
    #[serde(default)]
    provider_txn_id: Option<String>,
    #[serde(default)]
    payment_status: Option<i32>,
    #[serde(default)]
    amount: Option<i64>,
}

/// Provider status code for a completed payment
const TWO_PHASE_STATUS_PAID: i32 = 2;

#[derive(Clone)]
pub struct TwoPhaseClient {
    http: reqwest::Client,
    config: TwoPhaseConfig,
    retry: RetryPolicy,
}

impl TwoPhaseClient {
    pub fn new(config: TwoPhaseConfig, reconcile: &ReconcileConfig) -> BillingResult<Self> {
        Ok(Self {
            http: build_http(reconcile)?,
            config,
            retry: RetryPolicy::from_config(reconcile),
        })
    }

    /// `Auth` header value: `user:sha256(timestamp ‖ secret):timestamp`
    fn auth_header(&self, timestamp: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(timestamp.to_string().as_bytes());
        hasher.update(self.config.secret_key.as_bytes());
        format!(
            "{}:{}:{}",
            self.config.merchant_user_id,
            hex::encode(hasher.finalize()),
            timestamp
        )
    }
}

#[async_trait]
impl StatusSource for TwoPhaseClient {
    async fn fetch_status(&self, payment: &Payment) -> BillingResult<ProviderStatus> {
        let url = format!(
            "{}/payment/status/{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.service_id,
            payment.id
        );

        let url = url.as_str();
        let response: TwoPhaseStatusResponse = self
            .retry
            .run("two_phase_status", move || async move {
                let auth = self.auth_header(OffsetDateTime::now_utc().unix_timestamp());
                let response = self.http.get(url).header("Auth", auth).send().await?;

                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(status_error(status, &text));
                }
                Ok::<_, BillingError>(response.json::<TwoPhaseStatusResponse>().await?)
            })
            .await?;

        if response.error_code < 0 {
            tracing::debug!(
                payment_id = %payment.id,
                error_code = response.error_code,
                error_note = ?response.error_note,
                "Two-phase provider has no record of payment"
            );
            return Ok(ProviderStatus::Unknown);
        }

        let provider_ref = response.provider_txn_id;
        let status = match response.payment_status {
            Some(TWO_PHASE_STATUS_PAID) => ProviderStatus::Paid {
                provider_ref,
                amount: response.amount,
            },
            Some(code) if code < 0 => ProviderStatus::Failed { provider_ref },
            _ => ProviderStatus::Pending,
        };
        Ok(status)
    }
}
