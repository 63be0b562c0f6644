//! Background reconciliation against provider truth.
//!
//! Transactions stuck in PENDING or AUTHORIZED past the stale threshold
//! are checked against the provider's authoritative status endpoint and
//! forced onto the matching transition. Corrections carry the
//! Reconciliation source so the audit trail distinguishes them from
//! webhook-driven updates.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::ReconciliationConfig;
use crate::error::EngineError;
use crate::models::{PaymentTransaction, TransactionStatus, TransitionSource};
use crate::services::ledger::{Ledger, TransitionDetail};
use crate::services::metrics;
use crate::services::provider::{ErrorClass, ProviderRegistry, ProviderStatus};
use crate::services::retry::RetryHandle;

const STALE_STATUSES: [TransactionStatus; 2] =
    [TransactionStatus::Pending, TransactionStatus::Authorized];

pub struct ReconciliationJob {
    ledger: Arc<Ledger>,
    providers: Arc<ProviderRegistry>,
    retry: RetryHandle,
    config: ReconciliationConfig,
}

impl ReconciliationJob {
    pub fn new(
        ledger: Arc<Ledger>,
        providers: Arc<ProviderRegistry>,
        retry: RetryHandle,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            ledger,
            providers,
            retry,
            config,
        }
    }

    /// Run the interval loop until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(self.config.interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    tracing::error!(error = %e, "Reconciliation sweep failed");
                }
            }
        })
    }

    /// One reconciliation sweep over every stale transaction.
    pub async fn run_once(&self) -> Result<(), EngineError> {
        let cutoff = Utc::now() - Duration::seconds(self.config.stale_after_secs);
        let stale = self.ledger.find_stale(&STALE_STATUSES, cutoff).await?;
        if stale.is_empty() {
            return Ok(());
        }

        tracing::info!(count = stale.len(), "Reconciling stale transactions");
        for txn in stale {
            if let Err(e) = self.reconcile(&txn).await {
                tracing::error!(
                    transaction_id = %txn.id,
                    error = %e,
                    "Failed to reconcile transaction"
                );
                metrics::record_reconciliation("error");
            }
        }
        Ok(())
    }

    async fn reconcile(&self, txn: &PaymentTransaction) -> Result<(), EngineError> {
        let provider_txn_id = match txn.provider_transaction_id.as_deref() {
            Some(id) => id,
            None => {
                // Never acknowledged by the provider; the charge cannot
                // settle anymore.
                tracing::warn!(
                    transaction_id = %txn.id,
                    status = %txn.status,
                    "Expiring stale transaction with no provider acknowledgement"
                );
                self.force(txn, TransactionStatus::Expired, "no provider acknowledgement")
                    .await?;
                self.retry.cancel(txn.id);
                metrics::record_reconciliation("expired");
                return Ok(());
            }
        };

        let adapter = self.providers.get(txn.provider)?;
        let provider_status = match adapter.query_status(provider_txn_id).await {
            Ok(status) => status,
            Err(e) if e.class == ErrorClass::Transient => {
                // Provider unreachable; the next sweep picks this up again.
                tracing::debug!(
                    transaction_id = %txn.id,
                    error = %e,
                    "Provider unreachable during reconciliation"
                );
                metrics::record_reconciliation("deferred");
                return Ok(());
            }
            Err(e) => {
                // The provider does not recognize the charge (or answered
                // something unclassifiable). An operator has to look.
                tracing::warn!(
                    transaction_id = %txn.id,
                    error = %e,
                    "Provider cannot resolve transaction, flagging for manual review"
                );
                self.ledger
                    .transition(
                        txn.id,
                        TransactionStatus::Failed,
                        TransitionDetail {
                            source: TransitionSource::Reconciliation,
                            reason: Some("provider could not resolve transaction".to_string()),
                            response_code: e.code.clone(),
                            response_message: Some(e.message.clone()),
                            manual_review: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                self.retry.cancel(txn.id);
                metrics::record_reconciliation("manual_review");
                return Ok(());
            }
        };

        let target = match provider_status {
            ProviderStatus::Pending => {
                // Still in flight on the provider side; nothing to correct.
                metrics::record_reconciliation("unchanged");
                return Ok(());
            }
            ProviderStatus::Authorized => TransactionStatus::Authorized,
            ProviderStatus::Succeeded => TransactionStatus::Succeeded,
            ProviderStatus::Failed => TransactionStatus::Failed,
            ProviderStatus::Cancelled => TransactionStatus::Cancelled,
            ProviderStatus::Expired => TransactionStatus::Expired,
            ProviderStatus::Refunded => TransactionStatus::Refunded,
        };

        if target == txn.status {
            metrics::record_reconciliation("unchanged");
            return Ok(());
        }

        tracing::info!(
            transaction_id = %txn.id,
            from = %txn.status,
            to = %target,
            "Reconciliation correcting transaction state"
        );
        match self.force(txn, target, "reconciled against provider status").await {
            Ok(updated) => {
                if updated.is_terminal() {
                    self.retry.cancel(updated.id);
                }
                metrics::record_reconciliation("corrected");
                Ok(())
            }
            Err(EngineError::InvalidTransition { .. }) => {
                // Another path moved the transaction first; the ledger has
                // already audited the discarded attempt.
                metrics::record_reconciliation("discarded");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn force(
        &self,
        txn: &PaymentTransaction,
        to: TransactionStatus,
        reason: &str,
    ) -> Result<PaymentTransaction, EngineError> {
        self.ledger
            .transition(
                txn.id,
                to,
                TransitionDetail::from_source(TransitionSource::Reconciliation).with_reason(reason),
            )
            .await
    }
}
