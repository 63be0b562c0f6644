use anyhow::Result;
use dotenvy::dotenv;
use rust_decimal::Decimal;
use secrecy::Secret;
use serde::Deserialize;
use std::env;
use std::str::FromStr;

use crate::models::PaymentProvider;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub providers: ProvidersConfig,
    pub retry: RetryConfig,
    pub reconciliation: ReconciliationConfig,
    pub fraud: FraudConfig,
    pub engine: EngineConfig,
    pub service_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ProvidersConfig {
    pub stripe: ProviderConfig,
    pub paypal: ProviderConfig,
    pub iyzico: ProviderConfig,
}

impl ProvidersConfig {
    pub fn get(&self, provider: PaymentProvider) -> &ProviderConfig {
        match provider {
            PaymentProvider::Stripe => &self.stripe,
            PaymentProvider::Paypal => &self.paypal,
            PaymentProvider::Iyzico => &self.iyzico,
        }
    }

    pub fn enabled(&self) -> Vec<(PaymentProvider, &ProviderConfig)> {
        PaymentProvider::ALL
            .iter()
            .map(|p| (*p, self.get(*p)))
            .filter(|(_, c)| c.enabled)
            .collect()
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Secret<String>,
    pub webhook_secret: Secret<String>,
    /// Currencies the provider settles directly; anything else is
    /// converted to `default_currency` before submission.
    pub currencies: Vec<String>,
    pub default_currency: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ReconciliationConfig {
    pub interval_secs: u64,
    /// How long a transaction may sit in PENDING/AUTHORIZED before the
    /// job asks the provider for the authoritative status.
    pub stale_after_secs: i64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct FraudConfig {
    pub challenge_threshold: Decimal,
    pub reject_threshold: Decimal,
    pub high_value_amount: Decimal,
}

#[derive(Deserialize, Clone, Debug)]
pub struct EngineConfig {
    /// Bounded retries of the read-modify-write cycle on version conflicts.
    pub cas_retries: u32,
    pub provider_timeout_ms: u64,
    pub event_buffer: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let host = env::var("PAYMENT_ENGINE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PAYMENT_ENGINE_PORT")
            .unwrap_or_else(|_| "3010".to_string())
            .parse()?;

        Ok(Self {
            server: ServerConfig { host, port },
            providers: ProvidersConfig {
                stripe: provider_from_env("STRIPE", "https://api.stripe.example", &["USD", "EUR", "GBP"], "USD"),
                paypal: provider_from_env("PAYPAL", "https://api.paypal.example", &["USD", "EUR"], "USD"),
                iyzico: provider_from_env("IYZICO", "https://api.iyzico.example", &["TRY", "USD"], "TRY"),
            },
            retry: RetryConfig {
                max_attempts: env_parse("PAYMENT_RETRY_MAX_ATTEMPTS", 5)?,
                base_delay_ms: env_parse("PAYMENT_RETRY_BASE_DELAY_MS", 1000)?,
                max_delay_ms: env_parse("PAYMENT_RETRY_MAX_DELAY_MS", 60_000)?,
            },
            reconciliation: ReconciliationConfig {
                interval_secs: env_parse("PAYMENT_RECONCILIATION_INTERVAL_SECS", 60)?,
                stale_after_secs: env_parse("PAYMENT_RECONCILIATION_STALE_SECS", 900)?,
            },
            fraud: FraudConfig {
                challenge_threshold: env_decimal("PAYMENT_FRAUD_CHALLENGE_THRESHOLD", "40")?,
                reject_threshold: env_decimal("PAYMENT_FRAUD_REJECT_THRESHOLD", "75")?,
                high_value_amount: env_decimal("PAYMENT_FRAUD_HIGH_VALUE_AMOUNT", "1000.00")?,
            },
            engine: EngineConfig {
                cas_retries: env_parse("PAYMENT_CAS_RETRIES", 3)?,
                provider_timeout_ms: env_parse("PAYMENT_PROVIDER_TIMEOUT_MS", 10_000)?,
                event_buffer: env_parse("PAYMENT_EVENT_BUFFER", 256)?,
            },
            service_name: "payment-engine".to_string(),
        })
    }
}

fn provider_from_env(
    prefix: &str,
    default_base: &str,
    default_currencies: &[&str],
    default_currency: &str,
) -> ProviderConfig {
    let enabled = env::var(format!("{prefix}_ENABLED"))
        .map(|v| v == "true")
        .unwrap_or(true);
    let base_url =
        env::var(format!("{prefix}_BASE_URL")).unwrap_or_else(|_| default_base.to_string());
    let api_key = env::var(format!("{prefix}_API_KEY")).unwrap_or_else(|_| "dev-key".to_string());
    let webhook_secret = env::var(format!("{prefix}_WEBHOOK_SECRET"))
        .unwrap_or_else(|_| "dev-webhook-secret".to_string());
    let currencies = env::var(format!("{prefix}_CURRENCIES"))
        .map(|v| v.split(',').map(|s| s.trim().to_uppercase()).collect())
        .unwrap_or_else(|_| default_currencies.iter().map(|s| s.to_string()).collect());

    ProviderConfig {
        enabled,
        base_url,
        api_key: Secret::new(api_key),
        webhook_secret: Secret::new(webhook_secret),
        currencies,
        default_currency: default_currency.to_string(),
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(v) => Ok(v.parse()?),
        Err(_) => Ok(default),
    }
}

fn env_decimal(key: &str, default: &str) -> Result<Decimal> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    Ok(Decimal::from_str(&raw)?)
}
