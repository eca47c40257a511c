// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types for tributary-core.
//!
//! Provides a unified error type for the engine plus the structured
//! error detail persisted on run/stream/webhook rows.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors that can occur while driving runs, streams, and webhooks.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineError {
    /// Run was not found in the database.
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// Stream was not found in the database.
    StreamNotFound {
        /// The stream ID that was not found.
        stream_id: String,
    },

    /// Webhook was not found in the database.
    WebhookNotFound {
        /// The webhook ID that was not found.
        webhook_id: String,
    },

    /// Integration was not found (deleted, or never existed).
    IntegrationNotFound {
        /// The integration ID that was not found.
        integration_id: String,
    },

    /// No platform adapter registered for the requested platform.
    AdapterNotFound {
        /// The platform with no registered adapter.
        platform: String,
    },

    /// A run is in a state that forbids the requested transition.
    InvalidRunState {
        /// The run ID.
        run_id: String,
        /// The actual state.
        state: String,
    },

    /// The platform adapter failed while planning a check fan-out.
    CheckFailed {
        /// The platform whose check failed.
        platform: String,
        /// Error details from the adapter.
        details: String,
    },

    /// A conditional single-row update touched an unexpected number of rows.
    ///
    /// This is a fatal bug, not a domain error: it means a precondition
    /// protecting against double-processing was broken. Callers must
    /// propagate it, never swallow it.
    RowCountMismatch {
        /// The operation whose assertion failed.
        operation: &'static str,
        /// The number of rows the operation expected to touch.
        expected: u64,
        /// The number of rows actually touched.
        actual: u64,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::StreamNotFound { .. } => "STREAM_NOT_FOUND",
            Self::WebhookNotFound { .. } => "WEBHOOK_NOT_FOUND",
            Self::IntegrationNotFound { .. } => "INTEGRATION_NOT_FOUND",
            Self::AdapterNotFound { .. } => "ADAPTER_NOT_FOUND",
            Self::InvalidRunState { .. } => "INVALID_RUN_STATE",
            Self::CheckFailed { .. } => "CHECK_FAILED",
            Self::RowCountMismatch { .. } => "ROW_COUNT_MISMATCH",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether this error is a fatal bug rather than a domain condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RowCountMismatch { .. })
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotFound { run_id } => {
                write!(f, "Run '{}' not found", run_id)
            }
            Self::StreamNotFound { stream_id } => {
                write!(f, "Stream '{}' not found", stream_id)
            }
            Self::WebhookNotFound { webhook_id } => {
                write!(f, "Webhook '{}' not found", webhook_id)
            }
            Self::IntegrationNotFound { integration_id } => {
                write!(f, "Integration '{}' not found", integration_id)
            }
            Self::AdapterNotFound { platform } => {
                write!(f, "No platform adapter registered for '{}'", platform)
            }
            Self::InvalidRunState { run_id, state } => {
                write!(f, "Run '{}' is in invalid state '{}'", run_id, state)
            }
            Self::CheckFailed { platform, details } => {
                write!(f, "Check for platform '{}' failed: {}", platform, details)
            }
            Self::RowCountMismatch {
                operation,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Expected {} row(s) to be affected by '{}', got {} instead",
                    expected, operation, actual
                )
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

/// Structured error payload persisted on a run/stream/webhook row.
///
/// Kept deliberately flat so operators can diagnose from the row alone
/// without replaying the unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Human-readable description of what the engine was doing.
    pub message: String,
    /// Message of the underlying error, if different.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_message: Option<String>,
    /// Backtrace or error chain rendering, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorDetail {
    /// Build a detail with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            original_message: None,
            stack: None,
        }
    }

    /// Build a detail wrapping an underlying error.
    pub fn wrapping(message: impl Into<String>, original: &dyn std::error::Error) -> Self {
        Self {
            message: message.into(),
            original_message: Some(original.to_string()),
            stack: None,
        }
    }

    /// Serialize to the JSON text stored in the row's error column.
    pub fn to_json(&self) -> String {
        // ErrorDetail has no non-serializable fields; this cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"message\":{:?}}}", self.message))
    }
}
