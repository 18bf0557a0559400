//! Error types and conversions

use crate::provider::ProviderId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("{provider}: {message}")]
    OAuth {
        provider: ProviderId,
        message: String,
    },

    #[error("Document error: {0}")]
    Document(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Build an OAuth error for a provider
    pub fn oauth(provider: ProviderId, message: impl Into<String>) -> Self {
        AppError::OAuth {
            provider,
            message: message.into(),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<AppError> for String {
    fn from(err: AppError) -> String {
        err.to_string()
    }
}
