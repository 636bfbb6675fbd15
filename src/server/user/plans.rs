use std::sync::Arc;

use axum::{Json, extract::State, response::IntoResponse};

use crate::server::AppState;
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};

/// Public price list.
pub async fn list_plans(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let plans = state.store.list_plans().api_err("Failed to list plans")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(plans)))
}
