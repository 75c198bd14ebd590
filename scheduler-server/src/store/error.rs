//! Storage errors

use shared::error::{AppError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid resume token: {0}")]
    InvalidToken(String),

    #[error("{collection} {key} not found")]
    NotFound { collection: &'static str, key: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match &err {
            StorageError::NotFound { collection, key } => {
                AppError::with_message(ErrorCode::NotFound, err.to_string())
                    .with_detail("collection", *collection)
                    .with_detail("key", key.clone())
            }
            StorageError::InvalidToken(_) => {
                AppError::with_message(ErrorCode::InvalidRequest, err.to_string())
            }
            _ => AppError::database(err.to_string()),
        }
    }
}
