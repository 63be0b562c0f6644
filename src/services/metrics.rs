use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Idempotent so test binaries that spin
/// up several applications in one process don't panic on re-install.
pub fn init_metrics() {
    if METRICS_HANDLE.get().is_some() {
        return;
    }
    if let Ok(handle) = PrometheusBuilder::new().install_recorder() {
        let _ = METRICS_HANDLE.set(handle);
    }
}

pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

/// Record an accepted transaction transition.
pub fn record_transaction(provider: &str, status: &str) {
    let labels = [
        ("provider", provider.to_string()),
        ("status", status.to_string()),
    ];
    counter!("payment_transactions_total", &labels).increment(1);
}

/// Record a discarded (out-of-order or unmatched) transition attempt.
pub fn record_discarded(source: &str) {
    let labels = [("source", source.to_string())];
    counter!("payment_discarded_transitions_total", &labels).increment(1);
}

pub fn record_webhook(provider: &str, outcome: &str) {
    let labels = [
        ("provider", provider.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!("payment_webhook_events_total", &labels).increment(1);
}

pub fn record_retry(provider: &str) {
    let labels = [("provider", provider.to_string())];
    counter!("payment_retries_total", &labels).increment(1);
}

pub fn record_reconciliation(result: &str) {
    let labels = [("result", result.to_string())];
    counter!("payment_reconciliation_total", &labels).increment(1);
}
