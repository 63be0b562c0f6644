//! Terminal-transition event fan-out for notification/reporting consumers.
//!
//! Delivery is at-least-once within the process; consumers are expected to
//! dedupe on (transaction_id, status).

use tokio::sync::broadcast;

use crate::models::PaymentEvent;

#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<PaymentEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PaymentEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: PaymentEvent) {
        tracing::debug!(
            transaction_id = %event.transaction_id,
            status = %event.status,
            "Publishing payment event"
        );
        // No receivers is fine; events are advisory.
        let _ = self.tx.send(event);
    }
}
