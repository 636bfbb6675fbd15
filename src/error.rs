use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("token lookup collision")]
    TokenLookupCollision,

    #[error("seat limit exceeded for this plan")]
    SeatLimitExceeded,

    #[error("storage limit exceeded: {used} of {limit} bytes")]
    QuotaExceeded { used: i64, limit: i64 },

    #[error("workspace is read-only")]
    ReadOnly,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid token format")]
    InvalidTokenFormat,

    #[error("token expired")]
    TokenExpired,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("upstream provider error: {0}")]
    Upstream(String),
}

pub type Result<T> = std::result::Result<T, Error>;
