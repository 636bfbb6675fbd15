use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::auth::RequireAdmin;
use crate::server::AppState;
use crate::server::dto::PaginationParams;
use crate::server::response::{
    ApiError, ApiResponse, DEFAULT_PAGE_SIZE, PaginatedResponse, StoreOptionExt, StoreResultExt,
    paginate,
};

pub async fn list_tokens(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> impl IntoResponse {
    let cursor = params.cursor.as_deref().unwrap_or("");

    let tokens = state
        .store
        .list_tokens(cursor, DEFAULT_PAGE_SIZE + 1)
        .api_err("Failed to list tokens")?;

    let (tokens, next_cursor, has_more) =
        paginate(tokens, DEFAULT_PAGE_SIZE as usize, |t| t.id.clone());

    Ok::<_, ApiError>(Json(PaginatedResponse::new(tokens, next_cursor, has_more)))
}

pub async fn get_token(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let token = state
        .store
        .get_token_by_id(&id)
        .api_err("Failed to get token")?
        .or_not_found("Token not found")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(token)))
}

pub async fn delete_token(
    admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let token = state
        .store
        .get_token_by_id(&id)
        .api_err("Failed to get token")?
        .or_not_found("Token not found")?;

    if token.id == admin.0.id {
        return Err(ApiError::bad_request("Cannot delete current token"));
    }

    state
        .store
        .delete_token(&token.id)
        .api_err("Failed to delete token")?;

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}
