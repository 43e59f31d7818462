//! Turn-level error taxonomy
//!
//! Every failure that ends a turn is one of the [`TurnError`] variants. Tool
//! failures never reach this type: the coordinator folds them into failed
//! tool results so the turn can continue.

use crate::llm::{LlmError, LlmErrorKind};
use crate::retrieval::RetrievalError;
use crate::storage::StorageError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Which collaborator a provider failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Model,
    ToolServer,
    Retrieval,
    FileStore,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provider::Model => "Model provider",
            Provider::ToolServer => "Tool server",
            Provider::Retrieval => "Retrieval service",
            Provider::FileStore => "File store",
        };
        f.write_str(name)
    }
}

/// Coarse classification carried on `turn_error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authorization,
    Provider,
    Timeout,
    Internal,
}

#[derive(Debug, Clone, Error)]
pub enum TurnError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not authorized to use {resource}")]
    Authorization { resource: String },

    #[error("{provider} failed: {message}")]
    Provider {
        provider: Provider,
        message: String,
        retryable: bool,
    },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TurnError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TurnError::Validation(_) => ErrorKind::Validation,
            TurnError::Authorization { .. } => ErrorKind::Authorization,
            TurnError::Provider { .. } => ErrorKind::Provider,
            TurnError::Timeout(_) => ErrorKind::Timeout,
            TurnError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            TurnError::Provider { retryable, .. } => *retryable,
            TurnError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Message safe to show to the user. Internal details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            TurnError::Internal(_) => {
                "Something went wrong while handling your message. Please try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<LlmError> for TurnError {
    fn from(err: LlmError) -> Self {
        match err.kind {
            LlmErrorKind::Timeout => TurnError::Timeout("Model call".to_string()),
            kind => TurnError::Provider {
                provider: Provider::Model,
                message: err.message,
                retryable: kind.is_retryable(),
            },
        }
    }
}

impl From<RetrievalError> for TurnError {
    fn from(err: RetrievalError) -> Self {
        TurnError::Provider {
            provider: Provider::Retrieval,
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

impl From<StorageError> for TurnError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Forbidden(_) => TurnError::Authorization {
                resource: "that file".to_string(),
            },
            StorageError::NotFound(reference) => {
                TurnError::validation(format!("Unknown file reference {reference}"))
            }
            StorageError::Io(message) => TurnError::Provider {
                provider: Provider::FileStore,
                message,
                retryable: false,
            },
        }
    }
}
