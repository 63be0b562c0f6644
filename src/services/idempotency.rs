//! Idempotency guard: deduplicates logically identical payment requests.
//!
//! The lookup-or-reserve is atomic (single map entry check-and-set) so two
//! concurrent identical requests can never both create a transaction. A key
//! reused with different parameters fails with `ConflictingRequest` and is
//! never silently overwritten.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{PaymentMethod, PaymentProvider};

/// The parameters that define "the same logical request".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFingerprint {
    pub amount: Decimal,
    pub currency: String,
    pub provider: PaymentProvider,
    pub method: PaymentMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Key unseen; the slot is now reserved for this caller.
    Fresh,
    /// An identical request already produced this transaction.
    Existing(Uuid),
    /// An identical request is being created right now by another caller.
    InFlight,
}

/// Persistence seam for guard state, which must survive process restarts
/// in production deployments. The in-memory engine implements the same
/// atomic contract and is owned by the application state.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn reserve(
        &self,
        caller_id: &str,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<Reservation, EngineError>;

    /// Bind a completed reservation to its transaction.
    async fn complete(&self, caller_id: &str, key: &str, transaction_id: Uuid);

    /// Drop a reservation whose transaction creation failed.
    async fn release(&self, caller_id: &str, key: &str);
}

#[derive(Clone)]
struct GuardRecord {
    fingerprint: RequestFingerprint,
    transaction_id: Option<Uuid>,
}

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<String, GuardRecord>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(caller_id: &str, key: &str) -> String {
        format!("{caller_id}:{key}")
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn reserve(
        &self,
        caller_id: &str,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<Reservation, EngineError> {
        use dashmap::mapref::entry::Entry;

        match self.records.entry(Self::slot(caller_id, key)) {
            Entry::Occupied(entry) => {
                let record = entry.get();
                if record.fingerprint != *fingerprint {
                    return Err(EngineError::ConflictingRequest(format!(
                        "idempotency key {key} was already used with different parameters"
                    )));
                }
                Ok(match record.transaction_id {
                    Some(id) => Reservation::Existing(id),
                    None => Reservation::InFlight,
                })
            }
            Entry::Vacant(entry) => {
                entry.insert(GuardRecord {
                    fingerprint: fingerprint.clone(),
                    transaction_id: None,
                });
                Ok(Reservation::Fresh)
            }
        }
    }

    async fn complete(&self, caller_id: &str, key: &str, transaction_id: Uuid) {
        if let Some(mut record) = self.records.get_mut(&Self::slot(caller_id, key)) {
            record.transaction_id = Some(transaction_id);
        }
    }

    async fn release(&self, caller_id: &str, key: &str) {
        self.records.remove(&Self::slot(caller_id, key));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Proceed,
    Replay(Uuid),
}

pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self { store }
    }

    /// Atomically look up or reserve the (caller, key) slot. An in-flight
    /// duplicate waits briefly for the winner to finish creating its
    /// transaction, then replays it.
    pub async fn check(
        &self,
        caller_id: &str,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<GuardDecision, EngineError> {
        for _ in 0..100 {
            match self.store.reserve(caller_id, key, fingerprint).await? {
                Reservation::Fresh => return Ok(GuardDecision::Proceed),
                Reservation::Existing(id) => return Ok(GuardDecision::Replay(id)),
                Reservation::InFlight => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        Err(EngineError::Transient(
            "identical request still in flight".to_string(),
        ))
    }

    pub async fn complete(&self, caller_id: &str, key: &str, transaction_id: Uuid) {
        self.store.complete(caller_id, key, transaction_id).await;
    }

    pub async fn release(&self, caller_id: &str, key: &str) {
        self.store.release(caller_id, key).await;
    }
}
