//! Application error model with MCP error mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to the appropriate MCP `ErrorData` type for protocol
//! compliance. Message-id, cursor and snapshot failures each get their own
//! variant so callers can tell "fix the request" apart from "start the search
//! over" and "the mailbox changed, search again".

use rmcp::model::ErrorData;
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Each variant maps to an MCP error code in [`ErrorData`] plus a stable
/// machine-readable `code` string.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Malformed stable message identifier
    #[error("invalid message_id: {0}; pass a message_id exactly as returned by a search")]
    InvalidMessageId(String),
    /// Message identifier references a different account than requested
    #[error("account mismatch: {0}")]
    AccountMismatch(String),
    /// Cursor is unknown, expired, evicted or already exhausted
    #[error("cursor is invalid or expired; start a new search without a cursor")]
    CursorNotFoundOrExpired,
    /// Cursor exists but belongs to another account/mailbox
    #[error("cursor does not match account/mailbox: {0}")]
    CursorAccountMismatch(String),
    /// Mailbox UIDVALIDITY differs from the snapshot embedded in an id or cursor
    #[error(
        "mailbox snapshot changed ({mailbox}: expected uidvalidity {expected}, found {observed}); search again"
    )]
    StaleMailboxSnapshot {
        mailbox: String,
        expected: u32,
        observed: u32,
    },
    /// Mailbox could not be opened for reasons unrelated to a snapshot change
    #[error("cannot open mailbox: {0}")]
    MailboxOpenFailure(String),
    /// Resource not found (account, message)
    #[error("not found: {0}")]
    NotFound(String),
    /// Authentication failure (bad credentials, account disabled)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Convenience constructor for `InvalidMessageId`
    pub fn invalid_message_id(msg: impl Into<String>) -> Self {
        Self::InvalidMessageId(msg.into())
    }

    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::InvalidMessageId(_) => "invalid_message_id",
            Self::AccountMismatch(_) => "account_mismatch",
            Self::CursorNotFoundOrExpired => "cursor_expired",
            Self::CursorAccountMismatch(_) => "cursor_mismatch",
            Self::StaleMailboxSnapshot { .. } => "stale_snapshot",
            Self::MailboxOpenFailure(_) => "mailbox_open_failed",
            Self::NotFound(_) => "not_found",
            Self::AuthFailed(_) => "auth_failed",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
        }
    }

    /// Convert to MCP `ErrorData`
    ///
    /// # Mappings
    ///
    /// - `InvalidInput`, `InvalidMessageId`, `AccountMismatch`,
    ///   `CursorAccountMismatch` → `invalid_params`
    /// - `CursorNotFoundOrExpired`, `NotFound` → `resource_not_found`
    /// - `StaleMailboxSnapshot`, `AuthFailed` → `invalid_request`
    /// - `MailboxOpenFailure`, `Timeout`, `Internal` → `internal_error`
    pub fn to_error_data(&self) -> ErrorData {
        let message = self.to_string();
        let data = Some(json!({ "code": self.code() }));
        match self {
            Self::InvalidInput(_)
            | Self::InvalidMessageId(_)
            | Self::AccountMismatch(_)
            | Self::CursorAccountMismatch(_) => ErrorData::invalid_params(message, data),
            Self::CursorNotFoundOrExpired | Self::NotFound(_) => {
                ErrorData::resource_not_found(message, data)
            }
            Self::StaleMailboxSnapshot { .. } | Self::AuthFailed(_) => {
                ErrorData::invalid_request(message, data)
            }
            Self::MailboxOpenFailure(_) | Self::Timeout(_) | Self::Internal(_) => {
                ErrorData::internal_error(message, data)
            }
        }
    }
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;
