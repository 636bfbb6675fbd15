use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use uuid::Uuid;

use crate::auth::RequireUser;
use crate::server::AppState;
use crate::server::dto::RecordAiUsageRequest;
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};
use crate::types::AiUsage;

use super::access::require_member;

pub async fn record_usage(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RecordAiUsageRequest>,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let access = require_member(store, &auth.user, &id)?;

    let provider = req.provider.trim().to_lowercase();
    if provider.is_empty() {
        return Err(ApiError::bad_request("provider cannot be empty"));
    }
    if req.input_tokens.is_some_and(|t| t < 0) || req.output_tokens.is_some_and(|t| t < 0) {
        return Err(ApiError::bad_request("token counts cannot be negative"));
    }
    let too_large = |t: Option<i64>| t.is_some_and(|t| t > AiUsage::MAX_TOKENS);
    if too_large(req.input_tokens) || too_large(req.output_tokens) {
        return Err(ApiError::bad_request(format!(
            "token counts cannot exceed {}",
            AiUsage::MAX_TOKENS
        )));
    }

    let usage = AiUsage {
        id: Uuid::new_v4().to_string(),
        user_id: auth.user.id.clone(),
        workspace_id: access.workspace.id,
        cost_cents: AiUsage::estimate_cost_cents(&provider, req.input_tokens, req.output_tokens),
        provider,
        model_name: req.model_name,
        input_tokens: req.input_tokens,
        output_tokens: req.output_tokens,
        created_at: Utc::now(),
    };

    store
        .record_ai_usage(&usage)
        .api_err("Failed to record AI usage")?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(usage))))
}

pub async fn get_summary(
    auth: RequireUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let store = state.store.as_ref();
    let access = require_member(store, &auth.user, &id)?;

    let summary = store
        .ai_usage_summary(&access.workspace.id)
        .api_err("Failed to summarize AI usage")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(summary)))
}
