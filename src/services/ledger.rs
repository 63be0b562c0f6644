//! Transaction ledger: the authoritative record and state machine.
//!
//! All mutation flows through [`Ledger`], which enforces the transition
//! table and applies every write through an optimistic-concurrency check:
//! a caller reads the current version, computes the next state, and the
//! store persists it only if the version is unchanged. Conflicting writers
//! retry the read-modify-write cycle a bounded number of times before
//! surfacing `ConcurrentModification`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    AuditEvent, PaymentEvent, PaymentProvider, PaymentTransaction, TransactionStatus,
    TransactionType, TransitionSource, UserPaymentStats,
};
use crate::services::events::EventPublisher;
use crate::services::metrics;

/// Query filter for transaction listings.
#[derive(Debug, Default, Clone)]
pub struct TransactionFilter {
    pub caller_id: Option<String>,
    pub subscription_id: Option<Uuid>,
    pub status: Option<TransactionStatus>,
    pub limit: usize,
    pub offset: usize,
}

/// Storage seam for the ledger. The shipped implementation is in-memory;
/// a database-backed store plugs in behind the same contract.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert(&self, txn: PaymentTransaction) -> Result<(), EngineError>;

    async fn get(&self, id: Uuid) -> Result<Option<PaymentTransaction>, EngineError>;

    async fn get_by_provider_id(
        &self,
        provider: PaymentProvider,
        provider_txn_id: &str,
    ) -> Result<Option<PaymentTransaction>, EngineError>;

    /// Compare-and-set update: persists `txn` with `expected_version + 1`
    /// only if the stored version still equals `expected_version`.
    async fn update(
        &self,
        txn: PaymentTransaction,
        expected_version: u64,
    ) -> Result<PaymentTransaction, EngineError>;

    /// Filtered listing, newest first, with the total match count.
    async fn list(
        &self,
        filter: &TransactionFilter,
    ) -> Result<(Vec<PaymentTransaction>, usize), EngineError>;

    /// Transactions sitting in one of `statuses` since before `older_than`.
    async fn find_stale(
        &self,
        statuses: &[TransactionStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<PaymentTransaction>, EngineError>;

    async fn stats_for_caller(&self, caller_id: &str) -> Result<UserPaymentStats, EngineError>;
}

/// In-memory store keyed by transaction id, with a secondary index on the
/// provider-assigned id. Contention is scoped per transaction entry.
#[derive(Default)]
pub struct InMemoryTransactionStore {
    transactions: DashMap<Uuid, PaymentTransaction>,
    provider_index: DashMap<(PaymentProvider, String), Uuid>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, txn: PaymentTransaction) -> Result<(), EngineError> {
        if let Some(ref provider_id) = txn.provider_transaction_id {
            self.provider_index
                .insert((txn.provider, provider_id.clone()), txn.id);
        }
        self.transactions.insert(txn.id, txn);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PaymentTransaction>, EngineError> {
        Ok(self.transactions.get(&id).map(|t| t.clone()))
    }

    async fn get_by_provider_id(
        &self,
        provider: PaymentProvider,
        provider_txn_id: &str,
    ) -> Result<Option<PaymentTransaction>, EngineError> {
        let id = self
            .provider_index
            .get(&(provider, provider_txn_id.to_string()))
            .map(|e| *e);
        match id {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        mut txn: PaymentTransaction,
        expected_version: u64,
    ) -> Result<PaymentTransaction, EngineError> {
        let id = txn.id;
        let mut entry = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(anyhow::anyhow!("transaction {id} not found")))?;

        if entry.version != expected_version {
            return Err(EngineError::ConcurrentModification(id));
        }

        txn.version = expected_version + 1;
        if let Some(ref provider_id) = txn.provider_transaction_id {
            if entry.provider_transaction_id.as_deref() != Some(provider_id.as_str()) {
                self.provider_index
                    .insert((txn.provider, provider_id.clone()), id);
            }
        }
        *entry = txn.clone();
        Ok(txn)
    }

    async fn list(
        &self,
        filter: &TransactionFilter,
    ) -> Result<(Vec<PaymentTransaction>, usize), EngineError> {
        let mut matches: Vec<PaymentTransaction> = self
            .transactions
            .iter()
            .filter(|t| {
                filter
                    .caller_id
                    .as_deref()
                    .map_or(true, |c| t.caller_id == c)
                    && filter
                        .subscription_id
                        .map_or(true, |s| t.subscription_id == Some(s))
                    && filter.status.map_or(true, |s| t.status == s)
            })
            .map(|t| t.clone())
            .collect();

        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matches.len();
        let page = matches
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect();
        Ok((page, total))
    }

    async fn find_stale(
        &self,
        statuses: &[TransactionStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<PaymentTransaction>, EngineError> {
        Ok(self
            .transactions
            .iter()
            .filter(|t| statuses.contains(&t.status) && t.updated_at <= older_than)
            .map(|t| t.clone())
            .collect())
    }

    async fn stats_for_caller(&self, caller_id: &str) -> Result<UserPaymentStats, EngineError> {
        let mut stats = UserPaymentStats::default();
        for txn in self.transactions.iter() {
            if txn.caller_id != caller_id || txn.transaction_type == TransactionType::Refund {
                continue;
            }
            stats.total_count += 1;
            match txn.status {
                TransactionStatus::Succeeded
                | TransactionStatus::RefundRequested
                | TransactionStatus::Refunded => {
                    stats.succeeded_count += 1;
                    stats.total_succeeded_amount += txn.amount;
                }
                TransactionStatus::Failed => stats.failed_count += 1,
                _ => {}
            }
            stats.total_refunded_amount += txn.refunded_amount;
        }
        Ok(stats)
    }
}

/// Side-channel facts carried by a transition request.
#[derive(Debug, Default, Clone)]
pub struct TransitionDetail {
    pub source: TransitionSource,
    pub reason: Option<String>,
    pub provider_transaction_id: Option<String>,
    pub response_code: Option<String>,
    pub response_message: Option<String>,
    /// Gateway that produced this result, recorded as `last_gateway`.
    pub gateway: Option<String>,
    /// Added to `refunded_amount` on the refund sub-path edges.
    pub refund_delta: Option<Decimal>,
    /// Amount settled when the charge succeeds; bounds later refunds.
    pub captured_amount: Option<Decimal>,
    /// Final processing fee, recorded when the charge settles.
    pub fee_amount: Option<Decimal>,
    pub processing_ms: Option<u64>,
    pub manual_review: bool,
}

impl TransitionDetail {
    pub fn from_source(source: TransitionSource) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Append-only audit trail, keyed by transaction.
#[derive(Default)]
pub struct AuditLog {
    entries: DashMap<Uuid, Vec<AuditEvent>>,
}

impl AuditLog {
    fn append(&self, event: AuditEvent) {
        self.entries
            .entry(event.transaction_id)
            .or_default()
            .push(event);
    }

    pub fn for_transaction(&self, id: Uuid) -> Vec<AuditEvent> {
        self.entries.get(&id).map(|e| e.clone()).unwrap_or_default()
    }
}

pub struct Ledger {
    store: Arc<dyn TransactionStore>,
    audit: AuditLog,
    events: EventPublisher,
    cas_retries: u32,
}

impl Ledger {
    pub fn new(store: Arc<dyn TransactionStore>, events: EventPublisher, cas_retries: u32) -> Self {
        Self {
            store,
            audit: AuditLog::default(),
            events,
            cas_retries,
        }
    }

    pub async fn create(
        &self,
        txn: PaymentTransaction,
    ) -> Result<PaymentTransaction, EngineError> {
        self.store.insert(txn.clone()).await?;
        self.record_audit(
            txn.id,
            None,
            TransactionStatus::Created,
            TransitionSource::Api,
            true,
            None,
        );
        metrics::record_transaction(txn.provider.as_str(), "CREATED");
        tracing::info!(
            transaction_id = %txn.id,
            caller_id = %txn.caller_id,
            amount = %txn.amount,
            currency = %txn.currency,
            provider = %txn.provider,
            "Transaction created"
        );
        Ok(txn)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<PaymentTransaction>, EngineError> {
        self.store.get(id).await
    }

    pub async fn expect(&self, id: Uuid) -> Result<PaymentTransaction, EngineError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(anyhow::anyhow!("transaction {id} not found")))
    }

    pub async fn get_by_provider_id(
        &self,
        provider: PaymentProvider,
        provider_txn_id: &str,
    ) -> Result<Option<PaymentTransaction>, EngineError> {
        self.store.get_by_provider_id(provider, provider_txn_id).await
    }

    pub async fn list(
        &self,
        filter: &TransactionFilter,
    ) -> Result<(Vec<PaymentTransaction>, usize), EngineError> {
        self.store.list(filter).await
    }

    pub async fn find_stale(
        &self,
        statuses: &[TransactionStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<PaymentTransaction>, EngineError> {
        self.store.find_stale(statuses, older_than).await
    }

    pub async fn stats_for_caller(
        &self,
        caller_id: &str,
    ) -> Result<UserPaymentStats, EngineError> {
        self.store.stats_for_caller(caller_id).await
    }

    pub fn audit_trail(&self, id: Uuid) -> Vec<AuditEvent> {
        self.audit.for_transaction(id)
    }

    /// Apply a state transition under the optimistic-concurrency check.
    ///
    /// An out-of-order request (source state does not admit `to`) is
    /// recorded as a discarded event and rejected; it is never merged.
    pub async fn transition(
        &self,
        id: Uuid,
        to: TransactionStatus,
        detail: TransitionDetail,
    ) -> Result<PaymentTransaction, EngineError> {
        let mut conflicts = 0;
        loop {
            let current = self.expect(id).await?;
            let from = current.status;

            if !from.can_transition_to(to) {
                self.record_audit(id, Some(from), to, detail.source, false, detail.reason.clone());
                metrics::record_discarded(&detail.source.to_string());
                tracing::warn!(
                    transaction_id = %id,
                    %from,
                    %to,
                    source = %detail.source,
                    "Discarding out-of-order transition"
                );
                return Err(EngineError::InvalidTransition { from, to });
            }

            let now = Utc::now();
            let mut next = current.clone();
            next.status = to;
            next.updated_at = now;
            if to.is_terminal() {
                next.finalized_at = Some(now);
            }
            // Provider transaction id is set exactly once.
            if next.provider_transaction_id.is_none() {
                next.provider_transaction_id = detail.provider_transaction_id.clone();
            }
            if detail.response_code.is_some() {
                next.provider_response_code = detail.response_code.clone();
            }
            if detail.response_message.is_some() {
                next.provider_response_message = detail.response_message.clone();
            }
            if detail.gateway.is_some() {
                next.last_gateway = detail.gateway.clone();
            }
            if let Some(delta) = detail.refund_delta {
                next.refunded_amount += delta;
            }
            if detail.captured_amount.is_some() {
                next.captured_amount = detail.captured_amount;
            }
            if detail.fee_amount.is_some() {
                next.fee_amount = detail.fee_amount;
            }
            if detail.processing_ms.is_some() {
                next.processing_ms = detail.processing_ms;
            }
            next.manual_review |= detail.manual_review;
            // Any accepted transition resolves an in-flight capture.
            next.capture_in_flight = false;
            if to.is_terminal() || to == TransactionStatus::Authorized {
                next.next_retry_at = None;
            }

            match self.store.update(next, current.version).await {
                Ok(saved) => {
                    self.record_audit(
                        id,
                        Some(from),
                        to,
                        detail.source,
                        true,
                        detail.reason.clone(),
                    );
                    metrics::record_transaction(saved.provider.as_str(), &to.to_string());
                    tracing::info!(
                        transaction_id = %id,
                        %from,
                        %to,
                        version = saved.version,
                        source = %detail.source,
                        "Transaction transitioned"
                    );
                    if to.is_terminal() {
                        self.events.publish(PaymentEvent {
                            transaction_id: id,
                            status: to,
                            reason: detail.reason.clone(),
                        });
                    }
                    return Ok(saved);
                }
                Err(EngineError::ConcurrentModification(_)) if conflicts < self.cas_retries => {
                    conflicts += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Record a scheduled retry on a PENDING transaction: bumps the
    /// attempt count and the version, leaves the status untouched.
    pub async fn record_retry_scheduled(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        response_code: Option<String>,
        response_message: Option<String>,
    ) -> Result<PaymentTransaction, EngineError> {
        let saved = self
            .mutate_in_status(id, TransactionStatus::Pending, |txn| {
                txn.attempt_count += 1;
                txn.next_retry_at = Some(next_retry_at);
                if response_code.is_some() {
                    txn.provider_response_code = response_code.clone();
                }
                if response_message.is_some() {
                    txn.provider_response_message = response_message.clone();
                }
            })
            .await?;
        self.record_audit(
            id,
            Some(TransactionStatus::Pending),
            TransactionStatus::Pending,
            TransitionSource::Retry,
            true,
            Some(format!("retry scheduled (attempt {})", saved.attempt_count)),
        );
        metrics::record_retry(saved.provider.as_str());
        Ok(saved)
    }

    /// Record the provider's asynchronous acknowledgement of a submission
    /// that is still PENDING (no state change yet).
    pub async fn record_provider_ack(
        &self,
        id: Uuid,
        provider_txn_id: String,
        response_code: Option<String>,
        response_message: Option<String>,
    ) -> Result<PaymentTransaction, EngineError> {
        self.mutate_in_status(id, TransactionStatus::Pending, |txn| {
            if txn.provider_transaction_id.is_none() {
                txn.provider_transaction_id = Some(provider_txn_id.clone());
            }
            txn.last_gateway = Some(txn.provider.as_str().to_string());
            if response_code.is_some() {
                txn.provider_response_code = response_code.clone();
            }
            if response_message.is_some() {
                txn.provider_response_message = response_message.clone();
            }
        })
        .await
    }

    /// Reserve an AUTHORIZED transaction for capture before the provider
    /// call is issued. The reservation is a CAS write, so exactly one of
    /// two concurrent capture requests wins; the loser gets
    /// `ConflictingRequest` without a provider settlement being sent.
    pub async fn begin_capture(&self, id: Uuid) -> Result<PaymentTransaction, EngineError> {
        let mut conflicts = 0;
        loop {
            let current = self.expect(id).await?;
            if current.status != TransactionStatus::Authorized {
                return Err(EngineError::InvalidTransition {
                    from: current.status,
                    to: TransactionStatus::Succeeded,
                });
            }
            if current.capture_in_flight {
                return Err(EngineError::ConflictingRequest(format!(
                    "capture already in progress for transaction {id}"
                )));
            }

            let mut next = current.clone();
            next.capture_in_flight = true;
            next.updated_at = Utc::now();

            match self.store.update(next, current.version).await {
                Ok(saved) => return Ok(saved),
                Err(EngineError::ConcurrentModification(_)) if conflicts < self.cas_retries => {
                    conflicts += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release a capture reservation after a retryable provider failure,
    /// leaving the transaction AUTHORIZED and capturable again.
    pub async fn end_capture(&self, id: Uuid) -> Result<PaymentTransaction, EngineError> {
        self.mutate_in_status(id, TransactionStatus::Authorized, |txn| {
            txn.capture_in_flight = false;
        })
        .await
    }

    /// Update the step-up authentication outcome on a CREATED transaction.
    pub async fn set_auth_outcome(
        &self,
        id: Uuid,
        outcome: crate::models::AuthOutcome,
    ) -> Result<PaymentTransaction, EngineError> {
        self.mutate_in_status(id, TransactionStatus::Created, |txn| {
            txn.authentication_outcome = outcome;
        })
        .await
    }

    /// Metadata mutation guarded by a status precondition, applied through
    /// the same bounded CAS loop as transitions.
    async fn mutate_in_status<F>(
        &self,
        id: Uuid,
        required: TransactionStatus,
        mutate: F,
    ) -> Result<PaymentTransaction, EngineError>
    where
        F: Fn(&mut PaymentTransaction),
    {
        let mut conflicts = 0;
        loop {
            let current = self.expect(id).await?;
            if current.status != required {
                return Err(EngineError::InvalidTransition {
                    from: current.status,
                    to: required,
                });
            }
            let mut next = current.clone();
            mutate(&mut next);
            next.updated_at = Utc::now();

            match self.store.update(next, current.version).await {
                Ok(saved) => return Ok(saved),
                Err(EngineError::ConcurrentModification(_)) if conflicts < self.cas_retries => {
                    conflicts += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record_audit(
        &self,
        transaction_id: Uuid,
        from: Option<TransactionStatus>,
        to: TransactionStatus,
        source: TransitionSource,
        accepted: bool,
        reason: Option<String>,
    ) {
        self.audit.append(AuditEvent {
            id: Uuid::new_v4(),
            transaction_id,
            from,
            to,
            source,
            accepted,
            reason,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthOutcome, PaymentMethod, RiskTier};
    use rust_decimal_macros::dec;

    fn ledger() -> Ledger {
        Ledger::new(
            Arc::new(InMemoryTransactionStore::new()),
            EventPublisher::new(16),
            3,
        )
    }

    fn sample_txn() -> PaymentTransaction {
        let now = Utc::now();
        PaymentTransaction {
            id: Uuid::new_v4(),
            caller_id: "user-1".to_string(),
            idempotency_key: None,
            subscription_id: None,
            amount: dec!(100.00),
            currency: "USD".to_string(),
            original_amount: None,
            original_currency: None,
            exchange_rate: None,
            fee_amount: None,
            captured_amount: None,
            refunded_amount: Decimal::ZERO,
            provider: PaymentProvider::Stripe,
            method: PaymentMethod::Card,
            transaction_type: TransactionType::Payment,
            description: None,
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
            parent_transaction_id: None,
            refund_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
            finalized_at: None,
        }
    }

    #[tokio::test]
    async fn transition_bumps_version_by_one() {
        let ledger = ledger();
        let txn = ledger.create(sample_txn()).await.unwrap();
        let updated = ledger
            .transition(
                txn.id,
                TransactionStatus::Pending,
                TransitionDetail::from_source(TransitionSource::Api),
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(updated.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn out_of_order_transition_is_discarded_and_audited() {
        let ledger = ledger();
        let txn = ledger.create(sample_txn()).await.unwrap();
        ledger
            .transition(
                txn.id,
                TransactionStatus::Pending,
                TransitionDetail::from_source(TransitionSource::Api),
            )
            .await
            .unwrap();
        ledger
            .transition(
                txn.id,
                TransactionStatus::Failed,
                TransitionDetail::from_source(TransitionSource::Provider),
            )
            .await
            .unwrap();

        // A late success webhook for the failed transaction is rejected.
        let err = ledger
            .transition(
                txn.id,
                TransactionStatus::Succeeded,
                TransitionDetail::from_source(TransitionSource::Webhook),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        let current = ledger.expect(txn.id).await.unwrap();
        assert_eq!(current.status, TransactionStatus::Failed);
        assert_eq!(current.version, 2);

        let trail = ledger.audit_trail(txn.id);
        let discarded: Vec<_> = trail.iter().filter(|e| !e.accepted).collect();
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].source, TransitionSource::Webhook);
    }

    #[tokio::test]
    async fn stale_version_write_is_rejected_by_store() {
        let store = InMemoryTransactionStore::new();
        let txn = sample_txn();
        store.insert(txn.clone()).await.unwrap();

        let mut first = txn.clone();
        first.status = TransactionStatus::Pending;
        store.update(first, 0).await.unwrap();

        let mut second = txn.clone();
        second.status = TransactionStatus::Cancelled;
        let err = store.update(second, 0).await.unwrap_err();
        assert!(matches!(err, EngineError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn terminal_transition_publishes_event() {
        let events = EventPublisher::new(16);
        let mut rx = events.subscribe();
        let ledger = Ledger::new(Arc::new(InMemoryTransactionStore::new()), events, 3);

        let txn = ledger.create(sample_txn()).await.unwrap();
        ledger
            .transition(
                txn.id,
                TransactionStatus::Pending,
                TransitionDetail::from_source(TransitionSource::Api),
            )
            .await
            .unwrap();
        ledger
            .transition(
                txn.id,
                TransactionStatus::Succeeded,
                TransitionDetail::from_source(TransitionSource::Provider),
            )
            .await
            .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.transaction_id, txn.id);
        assert_eq!(event.status, TransactionStatus::Succeeded);
    }

    #[tokio::test]
    async fn capture_reservation_admits_one_winner() {
        let ledger = ledger();
        let txn = ledger.create(sample_txn()).await.unwrap();
        ledger
            .transition(
                txn.id,
                TransactionStatus::Pending,
                TransitionDetail::from_source(TransitionSource::Api),
            )
            .await
            .unwrap();
        ledger
            .transition(
                txn.id,
                TransactionStatus::Authorized,
                TransitionDetail::from_source(TransitionSource::Provider),
            )
            .await
            .unwrap();

        let reserved = ledger.begin_capture(txn.id).await.unwrap();
        assert!(reserved.capture_in_flight);

        let err = ledger.begin_capture(txn.id).await.unwrap_err();
        assert!(matches!(err, EngineError::ConflictingRequest(_)));

        // Releasing the reservation makes the transaction capturable again.
        let released = ledger.end_capture(txn.id).await.unwrap();
        assert!(!released.capture_in_flight);
        ledger.begin_capture(txn.id).await.unwrap();
    }

    #[tokio::test]
    async fn settling_transition_clears_the_capture_reservation() {
        let ledger = ledger();
        let txn = ledger.create(sample_txn()).await.unwrap();
        ledger
            .transition(
                txn.id,
                TransactionStatus::Pending,
                TransitionDetail::from_source(TransitionSource::Api),
            )
            .await
            .unwrap();
        ledger
            .transition(
                txn.id,
                TransactionStatus::Authorized,
                TransitionDetail::from_source(TransitionSource::Provider),
            )
            .await
            .unwrap();
        ledger.begin_capture(txn.id).await.unwrap();

        let settled = ledger
            .transition(
                txn.id,
                TransactionStatus::Succeeded,
                TransitionDetail {
                    source: TransitionSource::Api,
                    captured_amount: Some(dec!(40.00)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!settled.capture_in_flight);
        assert_eq!(settled.captured_amount, Some(dec!(40.00)));
        assert_eq!(settled.remaining_refundable(), dec!(40.00));
    }

    #[tokio::test]
    async fn provider_index_resolves_after_ack() {
        let ledger = ledger();
        let txn = ledger.create(sample_txn()).await.unwrap();
        ledger
            .transition(
                txn.id,
                TransactionStatus::Pending,
                TransitionDetail::from_source(TransitionSource::Api),
            )
            .await
            .unwrap();
        ledger
            .record_provider_ack(txn.id, "ch_123".to_string(), None, None)
            .await
            .unwrap();

        let found = ledger
            .get_by_provider_id(PaymentProvider::Stripe, "ch_123")
            .await
            .unwrap()
            .expect("indexed by provider id");
        assert_eq!(found.id, txn.id);
    }
}
