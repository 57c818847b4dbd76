//! Error types for the PostgreSQL database operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Statement rejected or failed by the target PostgreSQL server
    #[error("{0}")]
    Postgres(String),

    /// Could not obtain a connection from the PostgreSQL pool
    #[error("PostgreSQL connection failed: {0}")]
    ConnectionFailed(String),

    /// Identifier cannot be interpolated into a statement
    #[error("Invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    /// Database spec failed validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Work queue item is not a `namespace/name` key
    #[error("Invalid resource key: {0:?}")]
    InvalidKey(String),

    /// The resource cache never reported its initial sync
    #[error("failed to wait for caches to sync")]
    CacheSync,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is worth another reconciliation attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::Postgres(_)
                | OperatorError::ConnectionFailed(_)
        )
    }

    /// Optimistic-concurrency rejection from the API server (stale resourceVersion)
    pub fn is_conflict(&self) -> bool {
        matches!(self, OperatorError::KubeError(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// Not-found response from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, OperatorError::KubeError(kube::Error::Api(ae)) if ae.code == 404)
    }
}

impl From<tokio_postgres::Error> for OperatorError {
    fn from(e: tokio_postgres::Error) -> Self {
        // The server-side message is what ends up in the resource status.
        match e.as_db_error() {
            Some(db) => OperatorError::Postgres(db.message().to_string()),
            None => OperatorError::Postgres(e.to_string()),
        }
    }
}

impl From<deadpool_postgres::PoolError> for OperatorError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        OperatorError::ConnectionFailed(e.to_string())
    }
}
