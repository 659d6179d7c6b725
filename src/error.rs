//! Error types for argus.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A request or event field failed validation. Maps to 400.
    #[error("{0}")]
    InvalidField(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("llm error: {0}")]
    Llm(#[from] crate::llm::LlmError),

    #[error("prompt template error: {0}")]
    Template(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
