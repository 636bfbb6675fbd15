use chrono::Utc;

use super::{TokenGenerator, parse_token};
use crate::store::Store;
use crate::types::Token;

#[derive(Debug)]
pub enum TokenValidationError {
    InvalidScheme,
    InvalidToken,
    TokenExpired,
    InternalError,
}

/// Extracts the token from a `Bearer` Authorization header.
/// Returns `Ok(None)` if no header is present.
pub fn extract_bearer_token(
    auth_header: Option<&str>,
) -> Result<Option<String>, TokenValidationError> {
    match auth_header {
        Some(header) => header
            .strip_prefix("Bearer ")
            .map(|t| Some(t.trim().to_string()))
            .ok_or(TokenValidationError::InvalidScheme),
        None => Ok(None),
    }
}

/// Validates a raw token string against the store and records its use.
pub fn validate_token(store: &dyn Store, raw_token: &str) -> Result<Token, TokenValidationError> {
    let (lookup, _secret) =
        parse_token(raw_token).map_err(|_| TokenValidationError::InvalidToken)?;

    let token = store
        .get_token_by_lookup(&lookup)
        .map_err(|_| TokenValidationError::InternalError)?
        .ok_or(TokenValidationError::InvalidToken)?;

    let generator = TokenGenerator::new();
    if !generator
        .verify(raw_token, &token.token_hash)
        .map_err(|_| TokenValidationError::InternalError)?
    {
        return Err(TokenValidationError::InvalidToken);
    }

    if token.expires_at.is_some_and(|expires_at| expires_at < Utc::now()) {
        return Err(TokenValidationError::TokenExpired);
    }

    if let Err(e) = store.update_token_last_used(&token.id) {
        tracing::warn!("Failed to update token last_used_at: {e}");
    }

    Ok(token)
}
