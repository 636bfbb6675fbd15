//! Browser login through OAuth providers and session inspection.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect},
    routing::{get, post},
};
use chrono::Utc;
use serde_json::json;

use crate::auth::{RequireUser, TokenGenerator};
use crate::oauth::generate_state;
use crate::server::AppState;
use crate::server::dto::{CallbackParams, MeResponse, MyWorkspace};
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};
use crate::types::{AuditEntry, OAuthProvider, OAuthState, StateRedemption};

pub fn auth_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/login/{provider}", get(login))
        .route("/callback/{provider}", get(callback))
        .route("/me", get(me))
        .route("/logout", post(logout))
}

fn frontend_redirect(state: &AppState, key: &str, value: &str) -> Redirect {
    Redirect::to(&format!(
        "{}/?{key}={}",
        state.frontend_url,
        urlencoding::encode(value)
    ))
}

fn login_error(state: &AppState, reason: &str) -> Redirect {
    frontend_redirect(state, "error", reason)
}

/// Starts a login: stores a single-use state and sends the browser to the provider.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> impl IntoResponse {
    let provider = OAuthProvider::parse(&provider)
        .ok_or_else(|| ApiError::not_found(format!("Unknown provider: {provider}")))?;
    let client = state
        .providers
        .get(&provider)
        .ok_or_else(|| ApiError::not_found(format!("Provider not configured: {provider}")))?;

    let csrf_state = generate_state();
    state
        .store
        .create_oauth_state(&OAuthState::new(csrf_state.clone(), provider, Utc::now()))
        .api_err("Failed to store OAuth state")?;

    Ok::<_, ApiError>(Redirect::to(&client.authorization_url(&csrf_state)))
}

/// Completes a login. Every outcome redirects to the frontend with either
/// `token` or `error` in the query string.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Redirect {
    let Some(provider) = OAuthProvider::parse(&provider) else {
        return login_error(&state, "unknown_provider");
    };
    let Some(csrf_state) = params.state.as_deref() else {
        return login_error(&state, "missing_state");
    };

    let now = Utc::now();
    match state.store.redeem_oauth_state(csrf_state, provider, now) {
        Ok(StateRedemption::Valid) => {}
        Ok(StateRedemption::Unknown) => return login_error(&state, "invalid_state"),
        Ok(StateRedemption::Expired) => return login_error(&state, "state_expired"),
        Ok(StateRedemption::ProviderMismatch) => {
            return login_error(&state, "provider_mismatch");
        }
        Err(e) => {
            tracing::error!("Failed to redeem OAuth state: {e}");
            return login_error(&state, "login_failed");
        }
    }

    if let Some(error) = params.error.as_deref() {
        return login_error(&state, error);
    }
    let Some(code) = params.code.as_deref() else {
        return login_error(&state, "missing_code");
    };
    let Some(client) = state.providers.get(&provider) else {
        return login_error(&state, "provider_not_configured");
    };

    let identity = match client.exchange_code(code).await {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(%provider, "OAuth code exchange failed: {e}");
            return login_error(&state, "oauth_failed");
        }
    };

    let (user, created) = match state.store.upsert_oauth_user(&identity, now) {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(%provider, "Failed to log in OAuth user: {e}");
            return login_error(&state, "login_failed");
        }
    };

    let issued = TokenGenerator::new().issue(
        state.store.as_ref(),
        false,
        Some(&user.id),
        Some(now + state.session_ttl),
    );
    let raw_token = match issued {
        Ok((raw_token, _)) => raw_token,
        Err(e) => {
            tracing::error!(user_id = %user.id, "Failed to issue session token: {e}");
            return login_error(&state, "login_failed");
        }
    };

    let entry = AuditEntry::new(if created { "user.signup" } else { "user.login" })
        .by_user(&user.id)
        .resource("user", &user.id)
        .details(json!({ "provider": provider }));
    if let Err(e) = state.store.insert_audit_entry(&entry) {
        tracing::warn!("Failed to write audit entry for login: {e}");
    }

    tracing::info!(user_id = %user.id, %provider, created, "User logged in");
    frontend_redirect(&state, "token", &raw_token)
}

pub async fn me(auth: RequireUser, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let workspaces = state
        .store
        .list_user_workspaces(&auth.user.id)
        .api_err("Failed to list workspaces")?
        .into_iter()
        .map(|(workspace, role)| MyWorkspace {
            is_owner: workspace.owner_user_id == auth.user.id,
            id: workspace.id,
            plan_id: workspace.plan_id,
            role,
            is_read_only: workspace.is_read_only,
        })
        .collect();

    Ok::<_, ApiError>(Json(ApiResponse::success(MeResponse {
        user: auth.user,
        workspaces,
        session_expires_at: auth.token.expires_at,
    })))
}

/// Revokes the session token used for this request.
pub async fn logout(auth: RequireUser, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state
        .store
        .delete_token(&auth.token.id)
        .api_err("Failed to revoke session")?;

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}
