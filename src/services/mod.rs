pub mod engine;
pub mod events;
pub mod fees;
pub mod fraud;
pub mod idempotency;
pub mod ledger;
pub mod metrics;
pub mod provider;
pub mod reconciliation;
pub mod retry;
pub mod webhook;

pub use engine::PaymentEngine;
pub use events::EventPublisher;
pub use fees::{FeeCalculator, FxConverter};
pub use fraud::FraudGate;
pub use idempotency::{IdempotencyGuard, InMemoryIdempotencyStore};
pub use ledger::{InMemoryTransactionStore, Ledger};
pub use metrics::{get_metrics, init_metrics};
pub use provider::{HttpProvider, ProviderRegistry};
pub use reconciliation::ReconciliationJob;
pub use retry::{RetryHandle, RetryScheduler};
pub use webhook::{WebhookDispatcher, WebhookVerifier};
