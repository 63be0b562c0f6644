//! Webhook verification and dispatch.
//!
//! Inbound provider events are authenticated with a per-provider
//! HMAC-SHA256 secret before anything is trusted, deduplicated by
//! (provider, event id), and then pushed through the same ledger
//! transition path as synchronous provider results.

use dashmap::DashSet;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ProvidersConfig;
use crate::error::EngineError;
use crate::models::{
    PaymentProvider, PaymentTransaction, TransactionStatus, TransactionType, TransitionSource,
};
use crate::services::ledger::{Ledger, TransitionDetail};
use crate::services::metrics;
use crate::services::retry::RetryHandle;

type HmacSha256 = Hmac<Sha256>;

/// Verified provider event payload.
#[derive(Debug, Deserialize, Clone)]
pub struct WebhookEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: WebhookEventType,
    pub provider_transaction_id: String,
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventType {
    #[serde(rename = "payment.authorized")]
    PaymentAuthorized,
    #[serde(rename = "payment.succeeded")]
    PaymentSucceeded,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.cancelled")]
    PaymentCancelled,
    #[serde(rename = "payment.expired")]
    PaymentExpired,
    #[serde(rename = "refund.succeeded")]
    RefundSucceeded,
}

impl WebhookEventType {
    /// Direct status mapping for payment events. Refund settlements have
    /// no single target state; they walk the parent's refund sub-path.
    fn target_status(&self) -> Option<TransactionStatus> {
        match self {
            Self::PaymentAuthorized => Some(TransactionStatus::Authorized),
            Self::PaymentSucceeded => Some(TransactionStatus::Succeeded),
            Self::PaymentFailed => Some(TransactionStatus::Failed),
            Self::PaymentCancelled => Some(TransactionStatus::Cancelled),
            Self::PaymentExpired => Some(TransactionStatus::Expired),
            Self::RefundSucceeded => None,
        }
    }
}

/// Authenticates webhook payloads against per-provider secrets.
///
/// The signature is `HMAC-SHA256(request_body, webhook_secret)`, hex
/// encoded, carried in the `X-Webhook-Signature` header.
pub struct WebhookVerifier {
    secrets: HashMap<PaymentProvider, Secret<String>>,
}

impl WebhookVerifier {
    pub fn from_config(providers: &ProvidersConfig) -> Self {
        let mut secrets = HashMap::new();
        for (provider, config) in providers.enabled() {
            secrets.insert(provider, config.webhook_secret.clone());
        }
        Self { secrets }
    }

    pub fn verify(
        &self,
        provider: PaymentProvider,
        body: &[u8],
        signature: &str,
    ) -> Result<(), EngineError> {
        let secret = self.secrets.get(&provider).ok_or_else(|| {
            EngineError::VerificationFailed(format!("no webhook secret for provider {provider}"))
        })?;

        let expected = compute_signature(body, secret.expose_secret());
        if expected == signature {
            Ok(())
        } else {
            metrics::record_webhook(provider.as_str(), "verification_failed");
            tracing::warn!(%provider, "Webhook signature verification failed");
            Err(EngineError::VerificationFailed(
                "webhook signature mismatch".to_string(),
            ))
        }
    }
}

pub fn compute_signature(payload: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied,
    /// Re-delivered event; a no-op.
    Duplicate,
    /// Unmatched transaction or out-of-order transition; logged, not applied.
    Discarded,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Discarded => "discarded",
        }
    }
}

pub struct WebhookDispatcher {
    ledger: Arc<Ledger>,
    retry: RetryHandle,
    seen: DashSet<(PaymentProvider, String)>,
}

impl WebhookDispatcher {
    pub fn new(ledger: Arc<Ledger>, retry: RetryHandle) -> Self {
        Self {
            ledger,
            retry,
            seen: DashSet::new(),
        }
    }

    /// Feed a verified event into the ledger.
    ///
    /// `ConcurrentModification` is propagated so the HTTP handler can ask
    /// the provider to re-deliver; everything else resolves to an
    /// acknowledged outcome. An errored delivery must stay replayable, so
    /// its dedupe entry is dropped before the error surfaces.
    pub async fn dispatch(
        &self,
        provider: PaymentProvider,
        event: WebhookEvent,
    ) -> Result<DispatchOutcome, EngineError> {
        let dedupe_key = (provider, event.event_id.clone());
        if !self.seen.insert(dedupe_key.clone()) {
            tracing::info!(
                %provider,
                event_id = %event.event_id,
                "Duplicate webhook delivery ignored"
            );
            metrics::record_webhook(provider.as_str(), "duplicate");
            return Ok(DispatchOutcome::Duplicate);
        }

        match self.apply(provider, &event).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.seen.remove(&dedupe_key);
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        provider: PaymentProvider,
        event: &WebhookEvent,
    ) -> Result<DispatchOutcome, EngineError> {
        let txn = match self
            .ledger
            .get_by_provider_id(provider, &event.provider_transaction_id)
            .await?
        {
            Some(txn) => txn,
            None => {
                tracing::warn!(
                    %provider,
                    event_id = %event.event_id,
                    provider_transaction_id = %event.provider_transaction_id,
                    "Webhook for unknown transaction discarded"
                );
                metrics::record_webhook(provider.as_str(), "unmatched");
                return Ok(DispatchOutcome::Discarded);
            }
        };

        let to = match event.event_type.target_status() {
            Some(to) => to,
            None => return self.settle_refund(provider, txn, event).await,
        };
        let detail = TransitionDetail {
            source: TransitionSource::Webhook,
            reason: Some(format!("webhook event {}", event.event_id)),
            response_code: event.code.clone(),
            response_message: event.message.clone(),
            ..Default::default()
        };

        match self.ledger.transition(txn.id, to, detail).await {
            Ok(updated) => {
                if updated.is_terminal() {
                    self.retry.cancel(updated.id);
                }
                metrics::record_webhook(provider.as_str(), "applied");
                Ok(DispatchOutcome::Applied)
            }
            Err(EngineError::InvalidTransition { .. }) => {
                // Already audited as discarded by the ledger.
                metrics::record_webhook(provider.as_str(), "discarded");
                Ok(DispatchOutcome::Discarded)
            }
            Err(e) => Err(e),
        }
    }

    /// Settle a provider-queued refund: the event matches the PENDING
    /// refund child, which succeeds, and the parent leaves
    /// REFUND_REQUESTED with its refunded balance updated.
    async fn settle_refund(
        &self,
        provider: PaymentProvider,
        child: PaymentTransaction,
        event: &WebhookEvent,
    ) -> Result<DispatchOutcome, EngineError> {
        if child.transaction_type != TransactionType::Refund {
            tracing::warn!(
                %provider,
                event_id = %event.event_id,
                transaction_id = %child.id,
                "Refund webhook matched a non-refund transaction, discarded"
            );
            metrics::record_webhook(provider.as_str(), "discarded");
            return Ok(DispatchOutcome::Discarded);
        }

        let detail = TransitionDetail {
            source: TransitionSource::Webhook,
            reason: Some(format!("webhook event {}", event.event_id)),
            response_code: event.code.clone(),
            response_message: event.message.clone(),
            ..Default::default()
        };
        let settled = match self
            .ledger
            .transition(child.id, TransactionStatus::Succeeded, detail)
            .await
        {
            Ok(settled) => settled,
            Err(EngineError::InvalidTransition { .. }) => {
                metrics::record_webhook(provider.as_str(), "discarded");
                return Ok(DispatchOutcome::Discarded);
            }
            Err(e) => return Err(e),
        };

        if let Some(parent_id) = settled.parent_transaction_id {
            let parent = self.ledger.expect(parent_id).await?;
            let captured = parent.captured_amount.unwrap_or(parent.amount);
            let target = if parent.refunded_amount + settled.amount >= captured {
                TransactionStatus::Refunded
            } else {
                TransactionStatus::Succeeded
            };
            self.ledger
                .transition(
                    parent_id,
                    target,
                    TransitionDetail {
                        source: TransitionSource::Webhook,
                        reason: Some("refund settled".to_string()),
                        refund_delta: Some(settled.amount),
                        ..Default::default()
                    },
                )
                .await?;
        }
        metrics::record_webhook(provider.as_str(), "applied");
        Ok(DispatchOutcome::Applied)
    }
}
