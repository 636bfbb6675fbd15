use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{Router, routing::get};
use chrono::Duration;

use super::admin::{admin_router, jobs_router};
use super::auth::auth_router;
use super::billing::billing_router;
use super::user::user_router;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::oauth::{ProviderRegistry, providers_from_config};
use crate::storage::FileStorage;
use crate::store::Store;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub storage: FileStorage,
    pub providers: ProviderRegistry,
    /// Browser destination after OAuth callbacks, without a trailing slash.
    pub frontend_url: String,
    pub session_ttl: Duration,
    pub stripe_webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: &ServerConfig) -> Result<Self> {
        Ok(Self {
            store,
            storage: FileStorage::new(&config.objects_dir()),
            providers: providers_from_config(config)?,
            frontend_url: config.frontend_url.trim_end_matches('/').to_string(),
            session_ttl: Duration::seconds(config.session_ttl_seconds),
            stripe_webhook_secret: config.stripe_webhook_secret.clone(),
        })
    }

    /// Replaces the configured identity providers.
    #[must_use]
    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        status.as_u16(),
        latency.as_millis()
    );

    response
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/admin", jobs_router())
        .nest("/api/v1/admin", admin_router())
        .nest("/api/v1/auth", auth_router())
        .nest("/api/v1/billing", billing_router())
        .nest("/api/v1", user_router())
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
