//! Provider adapters: the uniform boundary to external payment providers.
//!
//! Every provider error is classified into exactly one [`ErrorClass`];
//! the classification, not the raw provider response, drives ledger
//! transitions and retry eligibility.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::error::EngineError;
use crate::models::{PaymentMethod, PaymentProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network/timeout/5xx; eligible for scheduled retry.
    Transient,
    /// Business decline; terminal FAILED.
    Declined,
    /// Malformed or unacceptable request; terminal, caller-fixable.
    InvalidRequest,
    /// Anything unclassifiable; terminal FAILED, flagged for manual review.
    Unknown,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub class: ErrorClass,
    pub code: Option<String>,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            code: None,
            message: message.into(),
        }
    }

    pub fn declined(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Declined,
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::InvalidRequest,
            code,
            message: message.into(),
        }
    }

    pub fn unknown(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Unknown,
            code,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

/// Provider-reported state of a charge, normalized across providers.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Pending,
    Authorized,
    Succeeded,
    Failed,
    Cancelled,
    Expired,
    Refunded,
}

/// Normalized outbound charge request.
#[derive(Debug, Serialize, Clone)]
pub struct ProviderCharge {
    pub transaction_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    /// False requests authorization only (capture-later flow).
    pub capture: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Normalized provider result for submit/capture/cancel/refund.
#[derive(Debug, Clone)]
pub struct ProviderResult {
    pub status: ProviderStatus,
    pub provider_transaction_id: String,
    pub response_code: Option<String>,
    pub response_message: Option<String>,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> PaymentProvider;

    async fn submit(&self, charge: &ProviderCharge) -> Result<ProviderResult, ProviderError>;

    async fn capture(
        &self,
        provider_txn_id: &str,
        amount: Decimal,
    ) -> Result<ProviderResult, ProviderError>;

    async fn cancel(&self, provider_txn_id: &str) -> Result<ProviderResult, ProviderError>;

    async fn refund(
        &self,
        provider_txn_id: &str,
        amount: Decimal,
    ) -> Result<ProviderResult, ProviderError>;

    /// Authoritative status lookup, used by the reconciliation job.
    async fn query_status(&self, provider_txn_id: &str) -> Result<ProviderStatus, ProviderError>;
}

/// Successful response body from a provider's charge endpoints.
#[derive(Debug, Deserialize)]
struct ChargeResponse {
    id: String,
    status: ProviderStatus,
    code: Option<String>,
    message: Option<String>,
}

/// Provider error response body; tolerated missing on non-JSON bodies.
#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// HTTP adapter speaking the normalized charge wire shape. One instance
/// per configured provider; provider-specific behavior lives entirely in
/// the per-provider configuration, not in shared base state.
#[derive(Clone)]
pub struct HttpProvider {
    provider: PaymentProvider,
    client: Client,
    config: ProviderConfig,
}

impl HttpProvider {
    pub fn new(
        provider: PaymentProvider,
        config: ProviderConfig,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Internal(anyhow::anyhow!(e)))?;
        Ok(Self {
            provider,
            client,
            config,
        })
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<ProviderResult, ProviderError> {
        let url = format!("{}{path}", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::transient(format!("failed to read response: {e}")))?;

        tracing::debug!(provider = %self.provider, %status, body = %text, "Provider response");

        if status.is_success() {
            let parsed: ChargeResponse = serde_json::from_str(&text).map_err(|e| {
                ProviderError::unknown(None, format!("unparseable provider response: {e}"))
            })?;
            if parsed.status == ProviderStatus::Failed {
                return Err(ProviderError::declined(
                    parsed.code,
                    parsed
                        .message
                        .unwrap_or_else(|| "charge declined".to_string()),
                ));
            }
            Ok(ProviderResult {
                status: parsed.status,
                provider_transaction_id: parsed.id,
                response_code: parsed.code,
                response_message: parsed.message,
            })
        } else {
            Err(classify_http_error(status, &text))
        }
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ProviderError::transient(format!("provider call failed: {err}"))
    } else {
        ProviderError::unknown(None, format!("provider call failed: {err}"))
    }
}

fn classify_http_error(status: StatusCode, body: &str) -> ProviderError {
    let parsed: ProviderErrorBody = serde_json::from_str(body).unwrap_or(ProviderErrorBody {
        code: None,
        message: None,
    });
    let message = parsed
        .message
        .unwrap_or_else(|| format!("provider returned {status}"));

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::transient(message)
    } else if status == StatusCode::PAYMENT_REQUIRED {
        ProviderError::declined(parsed.code, message)
    } else if matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY
    ) {
        ProviderError::invalid_request(parsed.code, message)
    } else {
        ProviderError::unknown(parsed.code, message)
    }
}

#[async_trait]
impl ProviderAdapter for HttpProvider {
    fn provider(&self) -> PaymentProvider {
        self.provider
    }

    async fn submit(&self, charge: &ProviderCharge) -> Result<ProviderResult, ProviderError> {
        let body = serde_json::to_value(charge)
            .map_err(|e| ProviderError::unknown(None, format!("serialize charge: {e}")))?;
        self.post("/charges", &body).await
    }

    async fn capture(
        &self,
        provider_txn_id: &str,
        amount: Decimal,
    ) -> Result<ProviderResult, ProviderError> {
        self.post(
            &format!("/charges/{provider_txn_id}/capture"),
            &serde_json::json!({ "amount": amount }),
        )
        .await
    }

    async fn cancel(&self, provider_txn_id: &str) -> Result<ProviderResult, ProviderError> {
        self.post(
            &format!("/charges/{provider_txn_id}/void"),
            &serde_json::json!({}),
        )
        .await
    }

    async fn refund(
        &self,
        provider_txn_id: &str,
        amount: Decimal,
    ) -> Result<ProviderResult, ProviderError> {
        self.post(
            &format!("/charges/{provider_txn_id}/refunds"),
            &serde_json::json!({ "amount": amount }),
        )
        .await
    }

    async fn query_status(&self, provider_txn_id: &str) -> Result<ProviderStatus, ProviderError> {
        let url = format!("{}/charges/{provider_txn_id}", self.config.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::transient(format!("failed to read response: {e}")))?;

        if status.is_success() {
            let parsed: ChargeResponse = serde_json::from_str(&text).map_err(|e| {
                ProviderError::unknown(None, format!("unparseable provider response: {e}"))
            })?;
            Ok(parsed.status)
        } else {
            Err(classify_http_error(status, &text))
        }
    }
}

/// Provider adapters keyed by provider, built once at startup.
pub struct ProviderRegistry {
    adapters: HashMap<PaymentProvider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new(adapters: HashMap<PaymentProvider, Arc<dyn ProviderAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn get(&self, provider: PaymentProvider) -> Result<&Arc<dyn ProviderAdapter>, EngineError> {
        self.adapters.get(&provider).ok_or_else(|| {
            EngineError::InvalidRequest(anyhow::anyhow!(
                "payment provider {provider} is not configured"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = classify_http_error(StatusCode::SERVICE_UNAVAILABLE, "gateway down");
        assert_eq!(err.class, ErrorClass::Transient);
        let err = classify_http_error(StatusCode::TOO_MANY_REQUESTS, "{}");
        assert_eq!(err.class, ErrorClass::Transient);
    }

    #[test]
    fn payment_required_is_declined_with_code() {
        let err = classify_http_error(
            StatusCode::PAYMENT_REQUIRED,
            r#"{"code":"insufficient_funds","message":"card has insufficient funds"}"#,
        );
        assert_eq!(err.class, ErrorClass::Declined);
        assert_eq!(err.code.as_deref(), Some("insufficient_funds"));
    }

    #[test]
    fn client_errors_are_invalid_request() {
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::NOT_FOUND,
            StatusCode::UNPROCESSABLE_ENTITY,
        ] {
            let err = classify_http_error(status, "{}");
            assert_eq!(err.class, ErrorClass::InvalidRequest);
        }
    }

    #[test]
    fn anything_else_is_unknown() {
        let err = classify_http_error(StatusCode::IM_A_TEAPOT, "{}");
        assert_eq!(err.class, ErrorClass::Unknown);
    }
}
