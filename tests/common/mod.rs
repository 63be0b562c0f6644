//! Test helper module for payment-engine integration tests.
//!
//! Spawns the full application on a random port with in-memory stores
//! and a wiremock server standing in for every provider's HTTP API.

#![allow(dead_code)]

use payment_engine::{
    config::{
        Config, EngineConfig, FraudConfig, ProviderConfig, ProvidersConfig, ReconciliationConfig,
        RetryConfig, ServerConfig,
    },
    services::webhook::compute_signature,
    AppState, Application,
};
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;
use wiremock::MockServer;

pub const TEST_CALLER: &str = "test-caller";
pub const TEST_WEBHOOK_SECRET: &str = "test_webhook_secret";

pub struct TestApp {
    pub address: String,
    pub state: AppState,
    pub provider: MockServer,
    client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn with test defaults, letting the caller tweak the config
    /// (retry ceilings, reconciliation cadence) before startup.
    pub async fn spawn_with(customize: impl FnOnce(&mut Config)) -> Self {
        let provider = MockServer::start().await;
        let mut config = test_config(provider.uri());
        customize(&mut config);

        let application = Application::build(config)
            .await
            .expect("Failed to build application");
        let state = application.state().clone();
        let address = format!("http://127.0.0.1:{}", application.port());

        tokio::spawn(async move {
            application
                .run_until_stopped()
                .await
                .expect("Server stopped unexpectedly");
        });

        let client = reqwest::Client::new();
        let app = Self {
            address,
            state,
            provider,
            client,
        };
        app.wait_until_healthy().await;
        app
    }

    async fn wait_until_healthy(&self) {
        for _ in 0..50 {
            if let Ok(response) = self
                .client
                .get(format!("{}/health", self.address))
                .send()
                .await
            {
                if response.status().is_success() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("Application never became healthy");
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn create_payment(&self, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}/payments", self.address))
            .header("x-caller-id", TEST_CALLER)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get_payment(&self, id: Uuid) -> reqwest::Response {
        self.client
            .get(format!("{}/payments/{id}", self.address))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn post_action(&self, id: Uuid, action: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}/payments/{id}/{action}", self.address))
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Deliver a signed webhook the way a provider would.
    pub async fn deliver_webhook(&self, provider: &str, event: &Value) -> reqwest::Response {
        let body = serde_json::to_vec(event).unwrap();
        let signature = compute_signature(&body, TEST_WEBHOOK_SECRET);
        self.client
            .post(format!("{}/webhooks/{provider}", self.address))
            .header("x-webhook-signature", signature)
            .body(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn deliver_webhook_with_signature(
        &self,
        provider: &str,
        event: &Value,
        signature: &str,
    ) -> reqwest::Response {
        self.client
            .post(format!("{}/webhooks/{provider}", self.address))
            .header("x-webhook-signature", signature)
            .json(event)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Poll until the transaction reaches `status` or the deadline passes.
    pub async fn wait_for_status(&self, id: Uuid, status: &str) -> Value {
        for _ in 0..100 {
            let body: Value = self
                .get_payment(id)
                .await
                .json()
                .await
                .expect("Failed to parse transaction");
            if body["status"] == status {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let body: Value = self.get_payment(id).await.json().await.unwrap();
        panic!("Transaction {id} never reached {status}, last seen: {body}");
    }
}

/// Standard payment request body; tests override fields as needed.
pub fn payment_request(idempotency_key: &str) -> Value {
    json!({
        "idempotency_key": idempotency_key,
        "amount": "100.00",
        "currency": "USD",
        "provider": "stripe",
        "method": "card",
        "description": "integration test charge",
        "billing": { "country": "US", "card_country": "US", "card_last_four": "4242" },
        "device": { "ip_address": "203.0.113.7", "fingerprint": "fp-test-1" }
    })
}

fn test_config(provider_base_url: String) -> Config {
    let provider = |currencies: &[&str], default_currency: &str| ProviderConfig {
        enabled: true,
        base_url: provider_base_url.clone(),
        api_key: Secret::new("test-api-key".to_string()),
        webhook_secret: Secret::new(TEST_WEBHOOK_SECRET.to_string()),
        currencies: currencies.iter().map(|c| c.to_string()).collect(),
        default_currency: default_currency.to_string(),
    };

    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        providers: ProvidersConfig {
            stripe: provider(&["USD", "EUR", "GBP"], "USD"),
            paypal: provider(&["USD", "EUR"], "USD"),
            iyzico: provider(&["TRY", "USD"], "TRY"),
        },
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 400,
        },
        reconciliation: ReconciliationConfig {
            // Long interval so sweeps never interfere; the reconciliation
            // tests shorten it explicitly.
            interval_secs: 3600,
            stale_after_secs: 900,
        },
        fraud: FraudConfig {
            challenge_threshold: Decimal::from_str("40").unwrap(),
            reject_threshold: Decimal::from_str("75").unwrap(),
            high_value_amount: Decimal::from_str("1000.00").unwrap(),
        },
        engine: EngineConfig {
            cas_retries: 3,
            provider_timeout_ms: 2000,
            event_buffer: 64,
        },
        service_name: "payment-engine-test".to_string(),
    }
}
