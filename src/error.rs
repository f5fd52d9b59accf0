// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sync client.
//!
//! Protocol-level failures carry an [`ErrorCode`] so callers (and the
//! reconnect loop) can classify them without string matching. Local
//! failures (SQLite, JSON, configuration) keep their source error.
//!
//! # Error Classes
//!
//! | Class | Codes | Behavior |
//! |-------|-------|----------|
//! | throwable | `CONNECTION_FAILED_AFTER_RETRY`, `INTERNAL`, `AUTH_FAILED`, `FATAL_ERROR` | re-raised to the caller |
//! | fatal | `INVALID_REQUEST`, `UNKNOWN_SCHEMA_VSN`, `AUTH_REQUIRED`, `PROTO_VSN_MISMATCH` | wrapped with [`SyncError::wrap_fatal`], local database must be reset |
//! | out-of-sync | `BEHIND_WINDOW`, `INVALID_POSITION`, `SUBSCRIPTION_NOT_FOUND` | reset subscriptions and resume |
//! | transient | everything else | reconnect with backoff |
//!
//! # Retry Behavior
//!
//! [`SyncError::is_retryable()`] is what the connection backoff loop asks.
//! A retryable error is one that is neither throwable nor fatal.

use std::fmt;
use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Machine readable error kind shared by the wire protocol and the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConnectionFailedAfterRetry,
    ConnectionCancelledByDisconnect,
    Internal,
    Timeout,
    ReplicationNotStarted,
    ReplicationAlreadyStarted,
    UnexpectedState,
    UnexpectedMessageType,
    ProtocolViolation,
    UnknownDataType,
    SocketError,
    Unrecognized,
    FatalError,

    // auth
    AuthError,
    AuthFailed,
    AuthRequired,
    AuthExpired,

    // server errors
    InvalidRequest,
    ProtoVsnMismatch,
    ReplicationFailed,

    // start replication errors
    BehindWindow,
    InvalidPosition,
    SubscriptionNotFound,
    SubscriptionError,
    MalformedLsn,
    UnknownSchemaVsn,

    // subscription errors
    ShapeRequestError,
    SubscriptionIdAlreadyExists,
    SubscriptionAlreadyExists,
    UnexpectedSubscriptionState,

    // shape request errors
    TableNotFound,
    ReferentialIntegrityViolation,
    EmptyShapeDefinition,
    DuplicateTableInShapeDefinition,

    // subscription data errors
    ShapeDeliveryError,
    ShapeSizeLimitExceeded,
}

impl ErrorCode {
    /// Screaming-snake name used in logs and persisted error reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailedAfterRetry => "CONNECTION_FAILED_AFTER_RETRY",
            Self::ConnectionCancelledByDisconnect => "CONNECTION_CANCELLED_BY_DISCONNECT",
            Self::Internal => "INTERNAL",
            Self::Timeout => "TIMEOUT",
            Self::ReplicationNotStarted => "REPLICATION_NOT_STARTED",
            Self::ReplicationAlreadyStarted => "REPLICATION_ALREADY_STARTED",
            Self::UnexpectedState => "UNEXPECTED_STATE",
            Self::UnexpectedMessageType => "UNEXPECTED_MESSAGE_TYPE",
            Self::ProtocolViolation => "PROTOCOL_VIOLATION",
            Self::UnknownDataType => "UNKNOWN_DATA_TYPE",
            Self::SocketError => "SOCKET_ERROR",
            Self::Unrecognized => "UNRECOGNIZED",
            Self::FatalError => "FATAL_ERROR",
            Self::AuthError => "AUTH_ERROR",
            Self::AuthFailed => "AUTH_FAILED",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::AuthExpired => "AUTH_EXPIRED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::ProtoVsnMismatch => "PROTO_VSN_MISMATCH",
            Self::ReplicationFailed => "REPLICATION_FAILED",
            Self::BehindWindow => "BEHIND_WINDOW",
            Self::InvalidPosition => "INVALID_POSITION",
            Self::SubscriptionNotFound => "SUBSCRIPTION_NOT_FOUND",
            Self::SubscriptionError => "SUBSCRIPTION_ERROR",
            Self::MalformedLsn => "MALFORMED_LSN",
            Self::UnknownSchemaVsn => "UNKNOWN_SCHEMA_VSN",
            Self::ShapeRequestError => "SHAPE_REQUEST_ERROR",
            Self::SubscriptionIdAlreadyExists => "SUBSCRIPTION_ID_ALREADY_EXISTS",
            Self::SubscriptionAlreadyExists => "SUBSCRIPTION_ALREADY_EXISTS",
            Self::UnexpectedSubscriptionState => "UNEXPECTED_SUBSCRIPTION_STATE",
            Self::TableNotFound => "TABLE_NOT_FOUND",
            Self::ReferentialIntegrityViolation => "REFERENTIAL_INTEGRITY_VIOLATION",
            Self::EmptyShapeDefinition => "EMPTY_SHAPE_DEFINITION",
            Self::DuplicateTableInShapeDefinition => "DUPLICATE_TABLE_IN_SHAPE_DEFINITION",
            Self::ShapeDeliveryError => "SHAPE_DELIVERY_ERROR",
            Self::ShapeSizeLimitExceeded => "SHAPE_SIZE_LIMIT_EXCEEDED",
        }
    }

    /// Errors re-raised to the caller instead of being absorbed by a reconnect.
    pub fn is_throwable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailedAfterRetry | Self::Internal | Self::AuthFailed | Self::FatalError
        )
    }

    /// Errors that can only be fixed by discarding the local database.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest | Self::UnknownSchemaVsn | Self::AuthRequired | Self::ProtoVsnMismatch
        )
    }

    /// Errors recoverable by resetting subscriptions and starting over.
    pub fn is_out_of_sync(&self) -> bool {
        matches!(
            self,
            Self::BehindWindow | Self::InvalidPosition | Self::SubscriptionNotFound
        )
    }

    /// Errors reported on the subscription channel rather than the generic one.
    pub fn is_subscription_error(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedSubscriptionState
                | Self::SubscriptionError
                | Self::SubscriptionAlreadyExists
                | Self::SubscriptionIdAlreadyExists
                | Self::SubscriptionNotFound
                | Self::ShapeDeliveryError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in the sync client.
///
/// Use [`code()`](Self::code) to get the protocol error kind and
/// [`is_retryable()`](Self::is_retryable) to decide whether to reconnect.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Protocol, replication, subscription or connection failure.
    ///
    /// Everything that crosses the wire or drives the replication state
    /// machine is reported through this variant.
    #[error("{code}: {message}")]
    Protocol { code: ErrorCode, message: String },

    /// SQLite error from the local database.
    ///
    /// Not retryable - the local store needs attention.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Malformed JSON in a persisted row, tag set or state blob.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or unsupported configuration or schema.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A collaborator (adapter, transport, migrator) failed.
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// Process state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl SyncError {
    /// Create a protocol error with the given code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolViolation, message)
    }

    /// The error kind. Local failures map to `INTERNAL`.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Protocol { code, .. } => *code,
            Self::Shutdown => ErrorCode::ConnectionCancelledByDisconnect,
            _ => ErrorCode::Internal,
        }
    }

    pub fn is_throwable(&self) -> bool {
        self.code().is_throwable()
    }

    pub fn is_fatal(&self) -> bool {
        self.code().is_fatal()
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.code().is_out_of_sync()
    }

    pub fn is_subscription_error(&self) -> bool {
        matches!(self, Self::Protocol { code, .. } if code.is_subscription_error())
    }

    /// Check if the connection backoff loop should try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Protocol { code, .. } => !code.is_throwable() && !code.is_fatal(),
            Self::Storage(_) => false,
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::Adapter(_) => true, // transport hiccups
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
        }
    }

    /// Wrap a fatal error into a `FATAL_ERROR` with remediation advice.
    pub fn wrap_fatal(self) -> Self {
        let code = self.code();
        Self::new(
            ErrorCode::FatalError,
            format!(
                "Fatal error ({code}): {self}. Check the server logs; the local database \
                 probably needs to be deleted and the client restarted."
            ),
        )
    }
}
