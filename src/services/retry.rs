//! Retry scheduler for transient provider failures.
//!
//! Eligible transactions are re-submitted through the same provider path
//! after an exponential backoff with jitter. Cancellation is safe to race
//! against a retry firing: the ledger's state check at apply time is the
//! final arbiter.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::time::delay_queue::DelayQueue;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::services::engine::PaymentEngine;

#[derive(Debug)]
pub enum RetryCommand {
    Schedule { transaction_id: Uuid, delay: Duration },
    Cancel { transaction_id: Uuid },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// True once `attempt` failed attempts have used up the ceiling.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Exponential backoff (base × 2^attempt, capped) plus 0-25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.0..0.25);
        exp.mul_f64(1.0 + jitter).min(self.max_delay)
    }
}

/// Cheap handle for scheduling and cancelling retries.
#[derive(Clone)]
pub struct RetryHandle {
    tx: mpsc::UnboundedSender<RetryCommand>,
    policy: RetryPolicy,
}

impl RetryHandle {
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn schedule(&self, transaction_id: Uuid, attempt: u32) -> Duration {
        let delay = self.policy.delay_for(attempt);
        self.schedule_after(transaction_id, delay);
        delay
    }

    /// Schedule with a delay the caller already computed (and recorded on
    /// the transaction as `next_retry_at`).
    pub fn schedule_after(&self, transaction_id: Uuid, delay: Duration) {
        tracing::info!(
            %transaction_id,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry"
        );
        let _ = self.tx.send(RetryCommand::Schedule {
            transaction_id,
            delay,
        });
    }

    pub fn cancel(&self, transaction_id: Uuid) {
        let _ = self.tx.send(RetryCommand::Cancel { transaction_id });
    }
}

pub struct RetryScheduler;

impl RetryScheduler {
    pub fn handle(policy: RetryPolicy) -> (RetryHandle, mpsc::UnboundedReceiver<RetryCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RetryHandle { tx, policy }, rx)
    }

    /// Run the scheduler loop until every handle is dropped.
    pub fn spawn(
        mut rx: mpsc::UnboundedReceiver<RetryCommand>,
        engine: Arc<PaymentEngine>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            use futures::StreamExt;

            let mut queue: DelayQueue<Uuid> = DelayQueue::new();
            let mut keys = HashMap::new();

            loop {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(RetryCommand::Schedule { transaction_id, delay }) => {
                            let key = queue.insert(transaction_id, delay);
                            if let Some(old) = keys.insert(transaction_id, key) {
                                queue.try_remove(&old);
                            }
                        }
                        Some(RetryCommand::Cancel { transaction_id }) => {
                            if let Some(key) = keys.remove(&transaction_id) {
                                queue.try_remove(&key);
                                tracing::debug!(%transaction_id, "Cancelled scheduled retry");
                            }
                        }
                        None => break,
                    },
                    Some(expired) = queue.next(), if !queue.is_empty() => {
                        let transaction_id = expired.into_inner();
                        keys.remove(&transaction_id);
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            engine.resubmit(transaction_id).await;
                        });
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        }
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = policy();
        // Jitter adds at most 25%, so consecutive attempts never overlap.
        assert!(policy.delay_for(1) >= Duration::from_millis(200));
        assert!(policy.delay_for(1) < Duration::from_millis(250));
        assert!(policy.delay_for(3) >= Duration::from_millis(800));
        assert!(policy.delay_for(3) < Duration::from_millis(1000));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        assert!(policy.delay_for(10) <= Duration::from_millis(300));
    }

    #[test]
    fn ceiling_is_enforced() {
        let policy = policy();
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
        assert!(policy.exhausted(6));
    }
}
