use thiserror::Error;

/// Errors raised by the gateway services
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Storage failure (pool exhaustion, SQL error, ...)
    #[error("Storage error: {0}")]
    Database(#[from] crate::db::DbError),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller supplied a value the domain rejects
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// JSON encoding of a stored blob failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Timestamp could not be formatted or read back
    #[error("Timestamp error: {0}")]
    Timestamp(String),
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Database(crate::db::DbError::Rusqlite(e))
    }
}

impl From<time::error::Format> for GatewayError {
    fn from(e: time::error::Format) -> Self {
        GatewayError::Timestamp(e.to_string())
    }
}

impl From<time::error::Parse> for GatewayError {
    fn from(e: time::error::Parse) -> Self {
        GatewayError::Timestamp(e.to_string())
    }
}

/// Result type alias for gateway services
pub type Result<T> = std::result::Result<T, GatewayError>;
