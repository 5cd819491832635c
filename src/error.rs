//! Error taxonomy for the sync engine.
//!
//! The split between [`SyncError::TransportFailure`] and
//! [`SyncError::ApplicationRejection`] drives the offline fallback: only a
//! request that never reached the server may be queued for a later push.

use std::time::Duration;

use thiserror::Error;

/// Fallback shown to the cashier when the server gave no usable message.
pub const GENERIC_SYNC_ERROR: &str = "Sync failed. Please check the connection and try again.";

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// The request never reached the server (connect/DNS/timeout/gateway).
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The server answered and refused the request.
    #[error("{message} (HTTP {status})")]
    ApplicationRejection { status: u16, message: String },

    /// The server accepted the HTTP request but refused the whole push batch.
    #[error("{0}")]
    BatchRejected(String),

    /// A durable local write or read failed. Never swallow this: a failed
    /// enqueue means an order the cashier believes was taken is lost.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Waiting for connectivity exceeded its budget.
    #[error("timed out after {0:?} waiting for connectivity")]
    Timeout(Duration),

    /// The server answered 2xx with a body we cannot decode.
    #[error("invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("terminal not configured: {0}")]
    NotConfigured(String),

    #[error("no queued order with temp id {0}")]
    UnknownOrder(String),
}

impl SyncError {
    pub fn rejection(status: u16, message: impl Into<String>) -> Self {
        Self::ApplicationRejection {
            status,
            message: message.into(),
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::StorageFailure(err.to_string())
    }

    /// True when the request may be retried later without the server having
    /// seen it.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::TransportFailure(_))
    }

    /// Message suitable for the status indicator.
    pub fn user_message(&self) -> String {
        match self {
            Self::ApplicationRejection { message, .. } | Self::BatchRejected(message)
                if !message.trim().is_empty() =>
            {
                message.clone()
            }
            Self::ApplicationRejection { .. }
            | Self::BatchRejected(_)
            | Self::TransportFailure(_) => {
                GENERIC_SYNC_ERROR.to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        Self::StorageFailure(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::StorageFailure(format!("queue lock poisoned: {err}"))
    }
}
