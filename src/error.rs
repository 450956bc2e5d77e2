//! Error types for the data store.

use thiserror::Error;

/// Main error type for store and engine operations.
#[derive(Debug, Error)]
pub enum DataDbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The collection is not declared in the active schema.
    #[error("Collection {0} is not declared in the schema")]
    UnknownCollection(String),

    /// The key argument does not match how the collection generates keys.
    #[error("Invalid key usage on {collection}: {reason}")]
    InvalidKeyUsage { collection: String, reason: String },

    #[error("No schema declared for version {0}")]
    UnknownSchemaVersion(u32),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid database version: {0}")]
    InvalidVersion(u32),

    #[error("Requested version {requested} is older than stored version {stored}")]
    VersionMismatch { requested: u32, stored: u32 },

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    #[error("Index {index} not found on {collection}")]
    IndexNotFound { collection: String, index: String },

    #[error("Index {index} already exists on {collection}")]
    IndexExists { collection: String, index: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Write attempted in a read-only transaction")]
    ReadOnly,

    #[error("Collection {0} is outside the transaction scope")]
    NotInScope(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Database is locked by another process")]
    Locked,

    #[error("Database not initialized")]
    NotInitialized,
}

impl From<serde_json::Error> for DataDbError {
    fn from(e: serde_json::Error) -> Self {
        DataDbError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for DataDbError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        DataDbError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DataDbError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        DataDbError::Deserialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for DataDbError {
    fn from(e: tokio::task::JoinError) -> Self {
        DataDbError::Transaction(format!("background write failed: {}", e))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, DataDbError>;
