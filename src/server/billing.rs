use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use chrono::Utc;

use crate::billing::{self, SIGNATURE_HEADER, WebhookOutcome};
use crate::server::AppState;
use crate::server::dto::WebhookResponse;
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};

pub fn billing_router() -> Router<Arc<AppState>> {
    Router::new().route("/webhook", post(webhook))
}

/// Receives signed subscription events from the billing provider.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(secret) = state.stripe_webhook_secret.as_deref() else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Billing webhooks are not configured",
        ));
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("Missing signature header"))?;

    let now = Utc::now();
    if let Err(e) = billing::verify_signature(&body, signature, secret, now) {
        tracing::warn!("Rejected billing webhook: {e}");
        return Err(ApiError::bad_request("Invalid signature"));
    }

    let event = billing::parse_event(&body).api_err("Invalid payload")?;
    let outcome = billing::apply_event(state.store.as_ref(), &event, now)
        .api_err("Failed to apply billing event")?;

    let outcome = match outcome {
        WebhookOutcome::Activated(id) => {
            tracing::info!(workspace_id = %id, "Subscription activated");
            "activated"
        }
        WebhookOutcome::Cancelled(id) => {
            tracing::info!(workspace_id = %id, "Subscription cancelled");
            "cancelled"
        }
        WebhookOutcome::Reactivated(id) => {
            tracing::info!(workspace_id = %id, "Subscription reactivated");
            "reactivated"
        }
        WebhookOutcome::SeatLimitExceeded(id) => {
            tracing::warn!(workspace_id = %id, "Plan change rejected by seat limit");
            "seat_limit_exceeded"
        }
        WebhookOutcome::Unchanged => "unchanged",
    };

    Ok(Json(ApiResponse::success(WebhookResponse {
        received: true,
        outcome,
    })))
}
