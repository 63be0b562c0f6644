//! Inbound provider webhook endpoint.
//!
//! The raw body is needed for signature verification, so the handler
//! takes `Bytes` and parses JSON only after the HMAC check passes.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::str::FromStr;

use crate::dtos::WebhookAck;
use crate::error::EngineError;
use crate::models::PaymentProvider;
use crate::services::webhook::WebhookEvent;
use crate::AppState;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, Response> {
    let provider = PaymentProvider::from_str(&provider)
        .map_err(|e| EngineError::NotFound(anyhow::anyhow!(e)).into_response())?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            EngineError::VerificationFailed("missing x-webhook-signature header".to_string())
                .into_response()
        })?;

    state
        .webhook_verifier
        .verify(provider, &body, signature)
        .map_err(IntoResponse::into_response)?;

    let event: WebhookEvent = serde_json::from_slice(&body).map_err(|e| {
        EngineError::InvalidRequest(anyhow::anyhow!("malformed webhook body: {e}")).into_response()
    })?;

    tracing::info!(
        %provider,
        event_id = %event.event_id,
        provider_transaction_id = %event.provider_transaction_id,
        "Webhook received"
    );

    match state.webhook_dispatcher.dispatch(provider, event).await {
        Ok(outcome) => Ok(Json(WebhookAck {
            received: true,
            outcome: outcome.as_str().to_string(),
        })),
        // 503 tells the provider to re-deliver once the contention clears.
        Err(EngineError::ConcurrentModification(id)) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": format!("transaction {id} is being modified, re-deliver")
            })),
        )
            .into_response()),
        Err(e) => Err(e.into_response()),
    }
}
