pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

use axum::middleware::from_fn;
use axum::{
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use config::Config;
use middleware::{metrics_middleware, request_id_middleware};
use services::provider::ProviderAdapter;
use services::retry::RetryPolicy;
use services::{
    EventPublisher, FraudGate, FxConverter, HttpProvider, IdempotencyGuard,
    InMemoryIdempotencyStore, InMemoryTransactionStore, Ledger, PaymentEngine, ProviderRegistry,
    ReconciliationJob, RetryScheduler, WebhookDispatcher, WebhookVerifier,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub ledger: Arc<Ledger>,
    pub engine: Arc<PaymentEngine>,
    pub webhook_verifier: Arc<WebhookVerifier>,
    pub webhook_dispatcher: Arc<WebhookDispatcher>,
    pub events: EventPublisher,
}

pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
    state: AppState,
}

impl Application {
    /// Wire up stores, provider adapters, background tasks and the HTTP
    /// router. The listener is bound here so tests can use port 0 and
    /// read the assigned port back.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        services::init_metrics();

        let events = EventPublisher::new(config.engine.event_buffer);
        let store = Arc::new(InMemoryTransactionStore::new());
        let ledger = Arc::new(Ledger::new(store, events.clone(), config.engine.cas_retries));
        let guard = IdempotencyGuard::new(Arc::new(InMemoryIdempotencyStore::new()));

        let timeout = Duration::from_millis(config.engine.provider_timeout_ms);
        let mut adapters: HashMap<_, Arc<dyn ProviderAdapter>> = HashMap::new();
        for (provider, provider_config) in config.providers.enabled() {
            let adapter = HttpProvider::new(provider, provider_config.clone(), timeout)?;
            adapters.insert(provider, Arc::new(adapter) as Arc<dyn ProviderAdapter>);
            tracing::info!(%provider, base_url = %provider_config.base_url, "Provider configured");
        }
        let registry = Arc::new(ProviderRegistry::new(adapters));

        let (retry_handle, retry_rx) = RetryScheduler::handle(RetryPolicy::from_config(&config.retry));

        let engine = Arc::new(PaymentEngine::new(
            ledger.clone(),
            guard,
            FraudGate::new(config.fraud.clone()),
            FxConverter::with_default_rates(),
            registry.clone(),
            config.providers.clone(),
            retry_handle.clone(),
        ));

        RetryScheduler::spawn(retry_rx, engine.clone());
        ReconciliationJob::new(
            ledger.clone(),
            registry,
            retry_handle.clone(),
            config.reconciliation.clone(),
        )
        .spawn();

        let webhook_verifier = Arc::new(WebhookVerifier::from_config(&config.providers));
        let webhook_dispatcher = Arc::new(WebhookDispatcher::new(ledger.clone(), retry_handle));

        let state = AppState {
            config: config.clone(),
            ledger,
            engine,
            webhook_verifier,
            webhook_dispatcher,
            events,
        };

        let router = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/ready", get(handlers::readiness_check))
            .route("/metrics", get(handlers::metrics_endpoint))
            .route(
                "/payments",
                post(handlers::payments::create_payment).get(handlers::payments::list_payments),
            )
            .route("/payments/:id", get(handlers::payments::get_payment))
            .route(
                "/payments/:id/capture",
                post(handlers::payments::capture_payment),
            )
            .route(
                "/payments/:id/cancel",
                post(handlers::payments::cancel_payment),
            )
            .route(
                "/payments/:id/refund",
                post(handlers::payments::refund_payment),
            )
            .route(
                "/payments/:id/step-up",
                post(handlers::payments::complete_step_up),
            )
            .route(
                "/payments/:id/audit",
                get(handlers::payments::get_audit_trail),
            )
            .route(
                "/payments/by-external/:provider_txn_id",
                get(handlers::payments::get_payment_by_external),
            )
            .route(
                "/payments/stats/:caller_id",
                get(handlers::payments::get_caller_stats),
            )
            .route(
                "/webhooks/:provider",
                post(handlers::webhooks::receive_webhook),
            )
            .layer(from_fn(metrics_middleware))
            .layer(from_fn(request_id_middleware))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-");

                    tracing::info_span!(
                        "http_request",
                        request_id = %request_id,
                        method = %request.method(),
                        uri = %request.uri(),
                        version = ?request.version(),
                    )
                }),
            )
            .with_state(state.clone());

        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            port,
            listener,
            router,
            state,
        })
    }

    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        tracing::info!("Listening on {}", self.listener.local_addr()?);
        axum::serve(self.listener, self.router).await?;
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }
}
