//! Provider and reconciliation configuration
//!
//! Every adapter receives its merchant credentials at construction. Nothing in
//! the core reads the environment after `BillingConfig::from_env` returns.

use std::fmt;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Merchant credentials for the two-phase (prepare/complete) provider.
#[derive(Clone)]
pub struct TwoPhaseConfig {
    pub service_id: String,
    pub merchant_id: String,
    pub merchant_user_id: String,
    pub secret_key: String,
    /// Merchant API base used for status lookups
    pub api_base: String,
    /// Hosted pay page; when set, intents carry a ready-made pay URL
    pub pay_url: Option<String>,
    pub return_url: Option<String>,
}

impl fmt::Debug for TwoPhaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoPhaseConfig")
            .field("service_id", &self.service_id)
            .field("merchant_id", &self.merchant_id)
            .field("merchant_user_id", &self.merchant_user_id)
            .field("secret_key", &"<redacted>")
            .field("api_base", &self.api_base)
            .field("pay_url", &self.pay_url)
            .field("return_url", &self.return_url)
            .finish()
    }
}

/// Credentials for the hosted-checkout provider.
#[derive(Clone)]
pub struct HostedCheckoutConfig {
    pub api_base: String,
    pub api_key: String,
    /// When set, webhooks without a valid signature are rejected
    pub webhook_secret: Option<String>,
    pub return_url: String,
}

impl fmt::Debug for HostedCheckoutConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostedCheckoutConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &"<redacted>")
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("return_url", &self.return_url)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Pending payments older than this are picked up by the scheduled sweep
    pub stale_after: Duration,
    /// Cancel payments the provider has never heard of once they are this old
    pub expire_unknown_after: Option<Duration>,
    pub batch_size: i64,
    pub request_timeout: Duration,
    pub max_retries: usize,
    pub retry_base_delay: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(15 * 60),
            expire_unknown_after: Some(Duration::from_secs(24 * 60 * 60)),
            batch_size: 50,
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BillingConfig {
    pub two_phase: Option<TwoPhaseConfig>,
    pub hosted_checkout: Option<HostedCheckoutConfig>,
    pub reconcile: ReconcileConfig,
}

impl BillingConfig {
    /// Load configuration from environment variables.
    ///
    /// A provider is enabled only when all of its required variables are set.
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let two_phase = match get("TWO_PHASE_SECRET_KEY") {
            Some(secret_key) => Some(TwoPhaseConfig {
                service_id: required(&get, "TWO_PHASE_SERVICE_ID")?,
                merchant_id: required(&get, "TWO_PHASE_MERCHANT_ID")?,
                merchant_user_id: required(&get, "TWO_PHASE_MERCHANT_USER_ID")?,
                secret_key,
                api_base: required(&get, "TWO_PHASE_API_BASE")?,
                pay_url: get("TWO_PHASE_PAY_URL"),
                return_url: get("TWO_PHASE_RETURN_URL"),
            }),
            None => None,
        };

        let hosted_checkout = match get("HOSTED_CHECKOUT_API_KEY") {
            Some(api_key) => Some(HostedCheckoutConfig {
                api_base: required(&get, "HOSTED_CHECKOUT_API_BASE")?,
                api_key,
                webhook_secret: get("HOSTED_CHECKOUT_WEBHOOK_SECRET"),
                return_url: required(&get, "HOSTED_CHECKOUT_RETURN_URL")?,
            }),
            None => None,
        };

        let defaults = ReconcileConfig::default();
        let expire_secs = parse_or(&get, "RECONCILE_EXPIRE_UNKNOWN_AFTER_SECS", 24 * 60 * 60)?;
        let reconcile = ReconcileConfig {
            stale_after: Duration::from_secs(parse_or(
                &get,
                "RECONCILE_STALE_AFTER_SECS",
                defaults.stale_after.as_secs(),
            )?),
            // 0 disables expiry
            expire_unknown_after: (expire_secs > 0).then(|| Duration::from_secs(expire_secs)),
            batch_size: parse_or(&get, "RECONCILE_BATCH_SIZE", defaults.batch_size)?,
            request_timeout: Duration::from_secs(parse_or(
                &get,
                "PROVIDER_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            max_retries: parse_or(&get, "PROVIDER_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay: defaults.retry_base_delay,
        };

        if two_phase.is_none() {
            tracing::warn!("Two-phase provider not configured (missing TWO_PHASE_SECRET_KEY)");
        }
        if hosted_checkout.is_none() {
            tracing::warn!("Hosted checkout not configured (missing HOSTED_CHECKOUT_API_KEY)");
        }

        Ok(Self {
            two_phase,
            hosted_checkout,
            reconcile,
        })
    }
}

fn required<G>(get: &G, key: &str) -> BillingResult<String>
where
    G: Fn(&str) -> Option<String>,
{
    get(key).ok_or_else(|| BillingError::Config(format!("{} must be set", key)))
}

fn parse_or<G, T>(get: &G, key: &str, default: T) -> BillingResult<T>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_empty_environment_disables_providers() {
        let config = BillingConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.two_phase.is_none());
        assert!(config.hosted_checkout.is_none());
        assert_eq!(config.reconcile.batch_size, 50);
    }

    #[test]
    fn test_partial_two_phase_config_is_an_error() {
        let result = BillingConfig::from_lookup(lookup(&[("TWO_PHASE_SECRET_KEY", "s")]));
        assert!(matches!(result, Err(BillingError::Config(msg)) if msg.contains("TWO_PHASE_SERVICE_ID")));
    }

    #[test]
    fn test_expiry_can_be_disabled() {
        let config = BillingConfig::from_lookup(lookup(&[(
            "RECONCILE_EXPIRE_UNKNOWN_AFTER_SECS",
            "0",
        )]))
        .unwrap();
        assert!(config.reconcile.expire_unknown_after.is_none());
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let result = BillingConfig::from_lookup(lookup(&[("RECONCILE_BATCH_SIZE", "lots")]));
        assert!(matches!(result, Err(BillingError::Config(_))));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = TwoPhaseConfig {
            service_id: "1".into(),
            merchant_id: "2".into(),
            merchant_user_id: "3".into(),
            secret_key: "super-secret".into(),
            api_base: "http://localhost".into(),
            pay_url: None,
            return_url: None,
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_hosted_checkout() {
        std::env::set_var("HOSTED_CHECKOUT_API_KEY", "key");
        std::env::set_var("HOSTED_CHECKOUT_API_BASE", "https://checkout.test");
        std::env::set_var("HOSTED_CHECKOUT_RETURN_URL", "https://app.test/return");
        std::env::remove_var("HOSTED_CHECKOUT_WEBHOOK_SECRET");

        let config = BillingConfig::from_env().unwrap();
        let hosted = config.hosted_checkout.unwrap();
        assert_eq!(hosted.api_base, "https://checkout.test");
        assert!(hosted.webhook_secret.is_none());

        std::env::remove_var("HOSTED_CHECKOUT_API_KEY");
        std::env::remove_var("HOSTED_CHECKOUT_API_BASE");
        std::env::remove_var("HOSTED_CHECKOUT_RETURN_URL");
    }
}
