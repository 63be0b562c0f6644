//! Payment pipeline orchestration.
//!
//! One pipeline serves synchronous API requests, scheduled retries and
//! step-up completions: idempotency guard, fraud gate, FX normalization,
//! ledger creation, provider submission, result handling. All state
//! changes go through the ledger's optimistic-concurrency path.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::config::ProvidersConfig;
use crate::dtos::{CreatePaymentRequest, StepUpOutcome};
use crate::error::EngineError;
use crate::models::{
    AuthOutcome, PaymentTransaction, RiskTier, TransactionStatus, TransactionType,
    TransitionSource,
};
use crate::services::fees::{FeeCalculator, FxConverter};
use crate::services::fraud::{FraudDecision, FraudGate};
use crate::services::idempotency::{GuardDecision, IdempotencyGuard, RequestFingerprint};
use crate::services::ledger::{Ledger, TransitionDetail};
use crate::services::provider::{
    ErrorClass, ProviderCharge, ProviderError, ProviderRegistry, ProviderResult, ProviderStatus,
};
use crate::services::retry::RetryHandle;

/// Result of a create call; replays carry the original transaction.
#[derive(Debug, Clone)]
pub struct CreatedPayment {
    pub transaction: PaymentTransaction,
    pub replayed: bool,
}

pub struct PaymentEngine {
    ledger: Arc<Ledger>,
    guard: IdempotencyGuard,
    fraud: FraudGate,
    fx: FxConverter,
    providers: Arc<ProviderRegistry>,
    providers_config: ProvidersConfig,
    retry: RetryHandle,
}

impl PaymentEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        guard: IdempotencyGuard,
        fraud: FraudGate,
        fx: FxConverter,
        providers: Arc<ProviderRegistry>,
        providers_config: ProvidersConfig,
        retry: RetryHandle,
    ) -> Self {
        Self {
            ledger,
            guard,
            fraud,
            fx,
            providers,
            providers_config,
            retry,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Entry point for a payment intent.
    ///
    /// Replayed idempotent requests return the existing transaction with
    /// `replayed` set; everything else runs the full pipeline. Provider
    /// outcomes (declines, scheduled retries) are reflected in the
    /// returned transaction rather than surfaced as errors.
    pub async fn create_payment(
        &self,
        caller_id: &str,
        request: CreatePaymentRequest,
    ) -> Result<CreatedPayment, EngineError> {
        use validator::Validate;
        request.validate()?;

        let fingerprint = RequestFingerprint {
            amount: request.amount,
            currency: request.currency.clone(),
            provider: request.provider,
            method: request.method,
        };

        if let Some(ref key) = request.idempotency_key {
            match self.guard.check(caller_id, key, &fingerprint).await? {
                GuardDecision::Proceed => {}
                GuardDecision::Replay(existing) => {
                    tracing::info!(
                        transaction_id = %existing,
                        caller_id,
                        idempotency_key = %key,
                        "Replaying idempotent request"
                    );
                    let transaction = self.ledger.expect(existing).await?;
                    return Ok(CreatedPayment {
                        transaction,
                        replayed: true,
                    });
                }
            }
        }

        let created = match self.create_transaction(caller_id, &request).await {
            Ok(txn) => {
                if let Some(ref key) = request.idempotency_key {
                    self.guard.complete(caller_id, key, txn.id).await;
                }
                txn
            }
            Err(e) => {
                if let Some(ref key) = request.idempotency_key {
                    self.guard.release(caller_id, key).await;
                }
                return Err(e);
            }
        };

        let transaction = match created.risk_decision() {
            FraudDecision::Reject => {
                tracing::warn!(
                    transaction_id = %created.id,
                    fraud_score = %created.fraud_score,
                    "Payment rejected by fraud gate"
                );
                self.ledger
                    .transition(
                        created.id,
                        TransactionStatus::Failed,
                        TransitionDetail::from_source(TransitionSource::Api)
                            .with_reason("fraud_rejected"),
                    )
                    .await?
            }
            FraudDecision::Challenge => {
                tracing::info!(
                    transaction_id = %created.id,
                    "Step-up authentication required before submission"
                );
                created
            }
            FraudDecision::Accept => self.submit_pipeline(created).await?,
        };
        Ok(CreatedPayment {
            transaction,
            replayed: false,
        })
    }

    /// Complete a pending step-up challenge and, on success, proceed to
    /// provider submission.
    pub async fn complete_step_up(
        &self,
        id: Uuid,
        outcome: StepUpOutcome,
    ) -> Result<PaymentTransaction, EngineError> {
        let txn = self.ledger.expect(id).await?;
        if txn.authentication_outcome != AuthOutcome::Pending {
            return Err(EngineError::InvalidRequest(anyhow::anyhow!(
                "transaction {id} has no pending step-up challenge"
            )));
        }

        match outcome {
            StepUpOutcome::Passed => {
                let txn = self.ledger.set_auth_outcome(id, AuthOutcome::Passed).await?;
                self.submit_pipeline(txn).await
            }
            StepUpOutcome::Failed => {
                self.ledger.set_auth_outcome(id, AuthOutcome::Failed).await?;
                self.ledger
                    .transition(
                        id,
                        TransactionStatus::Failed,
                        TransitionDetail::from_source(TransitionSource::Api)
                            .with_reason("step_up_failed"),
                    )
                    .await
            }
        }
    }

    /// Capture a previously authorized transaction.
    pub async fn capture(
        &self,
        id: Uuid,
        amount: Option<Decimal>,
    ) -> Result<PaymentTransaction, EngineError> {
        let txn = self.ledger.expect(id).await?;
        if txn.status != TransactionStatus::Authorized {
            return Err(EngineError::InvalidTransition {
                from: txn.status,
                to: TransactionStatus::Succeeded,
            });
        }

        let amount = amount.unwrap_or(txn.amount);
        if amount <= Decimal::ZERO || amount > txn.amount {
            return Err(EngineError::InvalidRequest(anyhow::anyhow!(
                "capture amount {amount} outside authorized amount {}",
                txn.amount
            )));
        }

        let provider_txn_id = txn.provider_transaction_id.clone().ok_or_else(|| {
            EngineError::InvalidRequest(anyhow::anyhow!(
                "transaction {id} has no provider acknowledgement to capture"
            ))
        })?;

        // Reserve before the provider call; a concurrent capture request
        // loses the reservation CAS and never reaches the provider.
        let txn = self.ledger.begin_capture(id).await?;

        let adapter = self.providers.get(txn.provider)?;
        match adapter.capture(&provider_txn_id, amount).await {
            Ok(result) => {
                let fee = FeeCalculator::processing_fee(amount, txn.provider, txn.method);
                self.apply_or_current(
                    id,
                    TransactionStatus::Succeeded,
                    TransitionDetail {
                        source: TransitionSource::Api,
                        reason: Some("captured".to_string()),
                        response_code: result.response_code,
                        response_message: result.response_message,
                        captured_amount: Some(amount),
                        fee_amount: Some(fee),
                        ..Default::default()
                    },
                )
                .await
            }
            Err(e) if e.class == ErrorClass::Transient => {
                // Release the reservation so a later capture can proceed.
                if let Err(release) = self.ledger.end_capture(id).await {
                    tracing::warn!(
                        transaction_id = %id,
                        error = %release,
                        "Failed to release capture reservation"
                    );
                }
                Err(EngineError::Transient(e.message))
            }
            Err(e) => {
                self.apply_or_current(
                    id,
                    TransactionStatus::Failed,
                    TransitionDetail {
                        source: TransitionSource::Api,
                        reason: Some("capture failed".to_string()),
                        response_code: e.code.clone(),
                        response_message: Some(e.message.clone()),
                        manual_review: e.class == ErrorClass::Unknown,
                        ..Default::default()
                    },
                )
                .await
            }
        }
    }

    /// Void an uncaptured transaction.
    pub async fn cancel(&self, id: Uuid) -> Result<PaymentTransaction, EngineError> {
        let txn = self.ledger.expect(id).await?;
        match txn.status {
            TransactionStatus::Created => {
                self.ledger
                    .transition(
                        id,
                        TransactionStatus::Cancelled,
                        TransitionDetail::from_source(TransitionSource::Api)
                            .with_reason("cancelled before submission"),
                    )
                    .await
            }
            TransactionStatus::Authorized => {
                let provider_txn_id = txn.provider_transaction_id.clone().ok_or_else(|| {
                    EngineError::InvalidRequest(anyhow::anyhow!(
                        "transaction {id} has no provider acknowledgement to void"
                    ))
                })?;
                let adapter = self.providers.get(txn.provider)?;
                match adapter.cancel(&provider_txn_id).await {
                    Ok(result) => {
                        self.apply_or_current(
                            id,
                            TransactionStatus::Cancelled,
                            TransitionDetail {
                                source: TransitionSource::Api,
                                reason: Some("voided before capture".to_string()),
                                response_code: result.response_code,
                                response_message: result.response_message,
                                ..Default::default()
                            },
                        )
                        .await
                    }
                    Err(e) if e.class == ErrorClass::Transient => {
                        Err(EngineError::Transient(e.message))
                    }
                    Err(e) => Err(EngineError::InvalidRequest(anyhow::anyhow!(
                        "provider refused void: {}",
                        e.message
                    ))),
                }
            }
            other => Err(EngineError::InvalidTransition {
                from: other,
                to: TransactionStatus::Cancelled,
            }),
        }
    }

    /// Refund part or all of a succeeded transaction. Creates a child
    /// refund transaction and walks the parent through the refund
    /// sub-path; a partial refund returns the parent to SUCCEEDED.
    pub async fn refund(
        &self,
        id: Uuid,
        amount: Decimal,
        reason: Option<String>,
    ) -> Result<PaymentTransaction, EngineError> {
        let parent = self.ledger.expect(id).await?;
        if parent.status != TransactionStatus::Succeeded {
            return Err(EngineError::InvalidTransition {
                from: parent.status,
                to: TransactionStatus::RefundRequested,
            });
        }
        if amount <= Decimal::ZERO || amount > parent.remaining_refundable() {
            return Err(EngineError::InvalidRequest(anyhow::anyhow!(
                "refund amount {amount} exceeds refundable balance {}",
                parent.remaining_refundable()
            )));
        }
        let provider_txn_id = parent.provider_transaction_id.clone().ok_or_else(|| {
            EngineError::InvalidRequest(anyhow::anyhow!(
                "transaction {id} has no provider acknowledgement to refund"
            ))
        })?;

        // Move the parent first: a concurrent duplicate refund request
        // loses the CAS race here and is rejected as out-of-order.
        self.ledger
            .transition(
                id,
                TransactionStatus::RefundRequested,
                TransitionDetail::from_source(TransitionSource::Api)
                    .with_reason(reason.clone().unwrap_or_else(|| "refund requested".into())),
            )
            .await?;

        let now = Utc::now();
        let child = PaymentTransaction {
            id: Uuid::new_v4(),
            caller_id: parent.caller_id.clone(),
            idempotency_key: None,
            subscription_id: parent.subscription_id,
            amount,
            currency: parent.currency.clone(),
            original_amount: None,
            original_currency: None,
            exchange_rate: None,
            fee_amount: None,
            captured_amount: None,
            refunded_amount: Decimal::ZERO,
            provider: parent.provider,
            method: parent.method,
            transaction_type: TransactionType::Refund,
            description: reason.clone().map(|r| format!("Refund: {r}")),
            provider_transaction_id: None,
            provider_response_code: None,
            provider_response_message: None,
            status: TransactionStatus::Created,
            fraud_score: Decimal::ZERO,
            risk_tier: RiskTier::Low,
            authentication_outcome: AuthOutcome::NotRequired,
            attempt_count: 0,
            next_retry_at: None,
            capture_in_flight: false,
            last_gateway: None,
            processing_ms: None,
            manual_review: false,
            parent_transaction_id: Some(parent.id),
            refund_reason: reason.clone(),
            version: 0,
            created_at: now,
            updated_at: now,
            finalized_at: None,
        };
        let child = self.ledger.create(child).await?;
        self.ledger
            .transition(
                child.id,
                TransactionStatus::Pending,
                TransitionDetail::from_source(TransitionSource::Api),
            )
            .await?;

        let adapter = self.providers.get(parent.provider)?;
        match adapter.refund(&provider_txn_id, amount).await {
            // Provider queued the refund; the parent stays in
            // REFUND_REQUESTED until the refund.succeeded webhook lands.
            Ok(result) if result.status == ProviderStatus::Pending => {
                tracing::info!(
                    transaction_id = %child.id,
                    parent_transaction_id = %id,
                    provider_refund_id = %result.provider_transaction_id,
                    "Refund accepted by provider, awaiting settlement webhook"
                );
                self.ledger
                    .record_provider_ack(
                        child.id,
                        result.provider_transaction_id,
                        result.response_code,
                        result.response_message,
                    )
                    .await
            }
            Ok(result) => {
                let child = self
                    .ledger
                    .transition(
                        child.id,
                        TransactionStatus::Succeeded,
                        TransitionDetail {
                            source: TransitionSource::Provider,
                            provider_transaction_id: Some(result.provider_transaction_id),
                            response_code: result.response_code,
                            response_message: result.response_message,
                            ..Default::default()
                        },
                    )
                    .await?;

                let captured = parent.captured_amount.unwrap_or(parent.amount);
                let parent_target = if parent.refunded_amount + amount >= captured {
                    TransactionStatus::Refunded
                } else {
                    TransactionStatus::Succeeded
                };
                self.ledger
                    .transition(
                        id,
                        parent_target,
                        TransitionDetail {
                            source: TransitionSource::Provider,
                            reason: Some("refund settled".to_string()),
                            refund_delta: Some(amount),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(child)
            }
            Err(e) => {
                self.ledger
                    .transition(
                        child.id,
                        TransactionStatus::Failed,
                        TransitionDetail {
                            source: TransitionSource::Provider,
                            reason: Some("refund failed".to_string()),
                            response_code: e.code.clone(),
                            response_message: Some(e.message.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.ledger
                    .transition(
                        id,
                        TransactionStatus::Succeeded,
                        TransitionDetail::from_source(TransitionSource::Provider)
                            .with_reason("refund failed"),
                    )
                    .await?;
                match e.class {
                    ErrorClass::Transient => Err(EngineError::Transient(e.message)),
                    ErrorClass::Declined => Err(EngineError::Declined {
                        code: e.code,
                        message: e.message,
                    }),
                    _ => Err(EngineError::InvalidRequest(anyhow::anyhow!(e.message))),
                }
            }
        }
    }

    /// Scheduled-retry entry point. The ledger state check decides whether
    /// the retry still applies; a transaction finished by another path is
    /// simply skipped.
    pub async fn resubmit(&self, id: Uuid) {
        let txn = match self.ledger.get(id).await {
            Ok(Some(txn)) => txn,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(transaction_id = %id, error = %e, "Retry lookup failed");
                return;
            }
        };
        if txn.status != TransactionStatus::Pending {
            tracing::debug!(
                transaction_id = %id,
                status = %txn.status,
                "Skipping retry, transaction left PENDING"
            );
            return;
        }
        tracing::info!(
            transaction_id = %id,
            attempt = txn.attempt_count,
            "Retrying provider submission"
        );
        if let Err(e) = self.submit_to_provider(txn, TransitionSource::Retry).await {
            tracing::warn!(transaction_id = %id, error = %e, "Retry submission failed");
        }
    }

    async fn create_transaction(
        &self,
        caller_id: &str,
        request: &CreatePaymentRequest,
    ) -> Result<PaymentTransaction, EngineError> {
        let provider_config = self.providers_config.get(request.provider);

        let (amount, currency, original_amount, original_currency, exchange_rate) =
            if provider_config.currencies.iter().any(|c| c == &request.currency) {
                (request.amount, request.currency.clone(), None, None, None)
            } else {
                let target = provider_config.default_currency.clone();
                let conversion =
                    self.fx
                        .convert(request.amount, &request.currency, &target)?;
                (
                    conversion.amount,
                    target,
                    Some(request.amount),
                    Some(request.currency.clone()),
                    Some(conversion.rate),
                )
            };

        let assessment = self.fraud.assess(
            amount,
            request.billing.as_ref(),
            request.device.as_ref(),
        );

        let authentication_outcome = match assessment.decision {
            FraudDecision::Challenge => AuthOutcome::Pending,
            _ => AuthOutcome::NotRequired,
        };

        let now = Utc::now();
        let txn = PaymentTransaction {
            id: Uuid::new_v4(),
            caller_id: caller_id.to_string(),
            idempotency_key: request.idempotency_key.clone(),
            subscription_id: request.subscription_id,
            amount,
            currency,
            original_amount,
            original_currency,
            exchange_rate,
            fee_amount: None,
            captured_amount: None,
            refunded_amount: Decimal::ZERO,
            provider: request.provider,
            method: request.method,
            transaction_type: request.transaction_type,
            description: request.description.clone(),
            provider_transaction_id: None,
            provider_response_code: None,
            provider_response_message: None,
            status: TransactionStatus::Created,
            fraud_score: assessment.score,
            risk_tier: assessment.tier,
            authentication_outcome,
            attempt_count: 0,
            next_retry_at: None,
            capture_in_flight: false,
            last_gateway: None,
            processing_ms: None,
            manual_review: false,
            parent_transaction_id: None,
            refund_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
            finalized_at: None,
        };
        self.ledger.create(txn).await
    }

    async fn submit_pipeline(
        &self,
        txn: PaymentTransaction,
    ) -> Result<PaymentTransaction, EngineError> {
        let txn = self
            .ledger
            .transition(
                txn.id,
                TransactionStatus::Pending,
                TransitionDetail::from_source(TransitionSource::Api)
                    .with_reason("submitted to provider"),
            )
            .await?;
        self.submit_to_provider(txn, TransitionSource::Provider).await
    }

    async fn submit_to_provider(
        &self,
        txn: PaymentTransaction,
        source: TransitionSource,
    ) -> Result<PaymentTransaction, EngineError> {
        let adapter = self.providers.get(txn.provider)?;
        let charge = ProviderCharge {
            transaction_id: txn.id,
            amount: txn.amount,
            currency: txn.currency.clone(),
            method: txn.method,
            capture: true,
            description: txn.description.clone(),
        };

        let started = Instant::now();
        let outcome = adapter.submit(&charge).await;
        let processing_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                self.apply_provider_result(&txn, result, processing_ms, source)
                    .await
            }
            Err(e) => self.handle_provider_error(&txn, e, source).await,
        }
    }

    async fn apply_provider_result(
        &self,
        txn: &PaymentTransaction,
        result: ProviderResult,
        processing_ms: u64,
        source: TransitionSource,
    ) -> Result<PaymentTransaction, EngineError> {
        match result.status {
            ProviderStatus::Succeeded => {
                let fee = FeeCalculator::processing_fee(txn.amount, txn.provider, txn.method);
                self.apply_or_current(
                    txn.id,
                    TransactionStatus::Succeeded,
                    TransitionDetail {
                        source,
                        provider_transaction_id: Some(result.provider_transaction_id),
                        response_code: result.response_code,
                        response_message: result.response_message,
                        gateway: Some(txn.provider.as_str().to_string()),
                        captured_amount: Some(txn.amount),
                        fee_amount: Some(fee),
                        processing_ms: Some(processing_ms),
                        ..Default::default()
                    },
                )
                .await
            }
            ProviderStatus::Authorized => {
                self.apply_or_current(
                    txn.id,
                    TransactionStatus::Authorized,
                    TransitionDetail {
                        source,
                        provider_transaction_id: Some(result.provider_transaction_id),
                        response_code: result.response_code,
                        response_message: result.response_message,
                        gateway: Some(txn.provider.as_str().to_string()),
                        processing_ms: Some(processing_ms),
                        ..Default::default()
                    },
                )
                .await
            }
            ProviderStatus::Pending => {
                // Awaiting the provider's webhook; just record the
                // acknowledgement so it can be matched later.
                self.ledger
                    .record_provider_ack(
                        txn.id,
                        result.provider_transaction_id,
                        result.response_code,
                        result.response_message,
                    )
                    .await
            }
            other => {
                tracing::error!(
                    transaction_id = %txn.id,
                    status = ?other,
                    "Unexpected provider status on submission"
                );
                self.apply_or_current(
                    txn.id,
                    TransactionStatus::Failed,
                    TransitionDetail {
                        source,
                        reason: Some(format!("unexpected provider status {other:?}")),
                        manual_review: true,
                        ..Default::default()
                    },
                )
                .await
            }
        }
    }

    async fn handle_provider_error(
        &self,
        txn: &PaymentTransaction,
        error: ProviderError,
        source: TransitionSource,
    ) -> Result<PaymentTransaction, EngineError> {
        match error.class {
            ErrorClass::Transient => {
                let attempt = txn.attempt_count + 1;
                if self.retry.policy().exhausted(attempt) {
                    tracing::warn!(
                        transaction_id = %txn.id,
                        attempt,
                        "Retry ceiling reached, failing transaction"
                    );
                    return self
                        .apply_or_current(
                            txn.id,
                            TransactionStatus::Failed,
                            TransitionDetail {
                                source,
                                reason: Some("RetryExhausted".to_string()),
                                response_code: error.code,
                                response_message: Some(error.message),
                                ..Default::default()
                            },
                        )
                        .await;
                }

                let delay = self.retry.policy().delay_for(attempt);
                let next_retry_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                let updated = self
                    .ledger
                    .record_retry_scheduled(
                        txn.id,
                        next_retry_at,
                        error.code,
                        Some(error.message),
                    )
                    .await?;
                self.retry.schedule_after(txn.id, delay);
                Ok(updated)
            }
            ErrorClass::Declined => {
                self.apply_or_current(
                    txn.id,
                    TransactionStatus::Failed,
                    TransitionDetail {
                        source,
                        reason: Some("provider declined".to_string()),
                        response_code: error.code,
                        response_message: Some(error.message),
                        ..Default::default()
                    },
                )
                .await
            }
            ErrorClass::InvalidRequest => {
                self.apply_or_current(
                    txn.id,
                    TransactionStatus::Failed,
                    TransitionDetail {
                        source,
                        reason: Some("invalid provider request".to_string()),
                        response_code: error.code,
                        response_message: Some(error.message),
                        ..Default::default()
                    },
                )
                .await
            }
            ErrorClass::Unknown => {
                self.apply_or_current(
                    txn.id,
                    TransactionStatus::Failed,
                    TransitionDetail {
                        source,
                        reason: Some("unclassified provider error".to_string()),
                        response_code: error.code,
                        response_message: Some(error.message),
                        manual_review: true,
                        ..Default::default()
                    },
                )
                .await
            }
        }
    }

    /// Apply a transition, deferring to whatever state another path
    /// already produced if ours is no longer valid.
    async fn apply_or_current(
        &self,
        id: Uuid,
        to: TransactionStatus,
        detail: TransitionDetail,
    ) -> Result<PaymentTransaction, EngineError> {
        match self.ledger.transition(id, to, detail).await {
            Ok(updated) => {
                if updated.is_terminal() {
                    self.retry.cancel(id);
                }
                Ok(updated)
            }
            Err(EngineError::InvalidTransition { .. }) => self.ledger.expect(id).await,
            Err(e) => Err(e),
        }
    }
}

impl PaymentTransaction {
    fn risk_decision(&self) -> FraudDecision {
        match (self.risk_tier, self.authentication_outcome) {
            (RiskTier::High, _) => FraudDecision::Reject,
            (_, AuthOutcome::Pending) => FraudDecision::Challenge,
            _ => FraudDecision::Accept,
        }
    }
}
