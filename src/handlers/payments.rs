//! Payment lifecycle endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::dtos::{
    CaptureRequest, CreatePaymentRequest, ListTransactionsQuery, ListTransactionsResponse,
    RefundRequest, StepUpRequest, TransactionResponse,
};
use crate::error::EngineError;
use crate::middleware::CallerContext;
use crate::models::{AuditEvent, PaymentProvider, UserPaymentStats};
use crate::services::ledger::TransactionFilter;
use crate::AppState;

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;

pub async fn create_payment(
    State(state): State<AppState>,
    caller: CallerContext,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<TransactionResponse>), EngineError> {
    let created = state
        .engine
        .create_payment(&caller.caller_id, request)
        .await?;
    let status = if created.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(created.transaction.into())))
}

pub async fn capture_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CaptureRequest>,
) -> Result<Json<TransactionResponse>, EngineError> {
    let txn = state.engine.capture(id, request.amount).await?;
    Ok(Json(txn.into()))
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TransactionResponse>, EngineError> {
    let txn = state.engine.cancel(id).await?;
    Ok(Json(txn.into()))
}

pub async fn refund_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RefundRequest>,
) -> Result<(StatusCode, Json<TransactionResponse>), EngineError> {
    use validator::Validate;
    request.validate()?;
    let refund = state
        .engine
        .refund(id, request.amount, request.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(refund.into())))
}

pub async fn complete_step_up(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<StepUpRequest>,
) -> Result<Json<TransactionResponse>, EngineError> {
    let txn = state.engine.complete_step_up(id, request.outcome).await?;
    Ok(Json(txn.into()))
}

pub async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TransactionResponse>, EngineError> {
    let txn = state.ledger.expect(id).await?;
    Ok(Json(txn.into()))
}

/// Lookup by the provider's transaction id. The provider namespace is
/// searched in registry order; ids are unique per provider.
pub async fn get_payment_by_external(
    State(state): State<AppState>,
    Path(provider_txn_id): Path<String>,
) -> Result<Json<TransactionResponse>, EngineError> {
    for provider in PaymentProvider::ALL {
        if let Some(txn) = state
            .ledger
            .get_by_provider_id(provider, &provider_txn_id)
            .await?
        {
            return Ok(Json(txn.into()));
        }
    }
    Err(EngineError::NotFound(anyhow::anyhow!(
        "no transaction with provider id {provider_txn_id}"
    )))
}

pub async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<ListTransactionsResponse>, EngineError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);
    let filter = TransactionFilter {
        caller_id: query.user,
        subscription_id: query.subscription_id,
        status: query.status,
        limit,
        offset,
    };
    let (transactions, total) = state.ledger.list(&filter).await?;
    Ok(Json(ListTransactionsResponse {
        transactions: transactions.into_iter().map(Into::into).collect(),
        total,
        limit,
        offset,
    }))
}

pub async fn get_caller_stats(
    State(state): State<AppState>,
    Path(caller_id): Path<String>,
) -> Result<Json<UserPaymentStats>, EngineError> {
    let stats = state.ledger.stats_for_caller(&caller_id).await?;
    Ok(Json(stats))
}

pub async fn get_audit_trail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<AuditEvent>>, EngineError> {
    state.ledger.expect(id).await?;
    Ok(Json(state.ledger.audit_trail(id)))
}
