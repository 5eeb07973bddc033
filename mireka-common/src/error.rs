//! Error types shared by every protocol and mail-handling component.

use std::io;

use thiserror::Error;

use crate::status::{EnhancedCode, EnhancedStatus, Reply, Status};

/// A deliberate refusal of a command, reported verbatim to the SMTP client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}")]
pub struct RejectError {
    pub status: EnhancedStatus,
}

impl RejectError {
    #[must_use]
    pub fn new(reply_code: u16, code: EnhancedCode, message: impl Into<String>) -> Self {
        Self {
            status: EnhancedStatus::new(reply_code, code, message.into()),
        }
    }

    /// A rejection with the enhanced code derived from the reply class.
    #[must_use]
    pub fn plain(reply_code: u16, message: impl Into<String>) -> Self {
        Self {
            status: EnhancedStatus::from_reply(reply_code, message.into()),
        }
    }

    #[must_use]
    pub fn reply(&self) -> Reply {
        self.status.reply()
    }

    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.status.should_retry()
    }
}

impl From<EnhancedStatus> for RejectError {
    fn from(status: EnhancedStatus) -> Self {
        Self { status }
    }
}

/// A misconfiguration detected while handling mail, e.g. an alias loop.
///
/// Never shown to the client in detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Configuration error: {0}")]
pub struct ConfigurationError(pub String);

/// A failure of a local component such as the queue store.
#[derive(Debug, Error)]
#[error("{status}: {detail}")]
pub struct LocalMailSystemError {
    pub status: EnhancedStatus,
    pub detail: String,
}

impl LocalMailSystemError {
    #[must_use]
    pub fn new(status: EnhancedStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    /// Wraps an I/O failure as a transient local error.
    #[must_use]
    pub fn io(context: &str, error: &io::Error) -> Self {
        Self::new(
            EnhancedStatus::TRANSIENT_LOCAL_ERROR,
            format!("{context}: {error}"),
        )
    }

    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.status.should_retry()
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.status.is_permanent()
    }

    /// What the SMTP client sees. The detail stays in the log.
    #[must_use]
    pub fn reply(&self) -> Reply {
        self.status.reply()
    }
}

/// Errors raised while validating a listener's protocol arguments.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("I/O error during validation: {0}")]
    Io(#[from] io::Error),
}

/// Errors that end a client session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    #[error("Shutdown requested")]
    Shutdown,

    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}

impl SessionError {
    /// Returns `true` if the error indicates a graceful shutdown.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Returns `true` if the error is a client-side issue.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }
}

/// Errors raised by a listener while accepting connections.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    AcceptFailed(#[from] io::Error),

    #[error("Protocol validation failed: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Reply used when a configuration error surfaces during a transaction.
#[must_use]
pub fn configuration_reply() -> Reply {
    Reply::enhanced(
        Status::TransactionFailed,
        EnhancedCode::new(5, 3, 0),
        "Mail server configuration is wrong",
    )
}

/// Reply used for unexpected failures during a transaction.
#[must_use]
pub fn internal_error_reply() -> Reply {
    Reply::new(Status::Error, "Internal error")
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn reject_renders_reply() {
        let reject = RejectError::new(550, EnhancedCode::new(5, 1, 1), "User unknown <a@b.c>");
        assert_eq!(reject.reply().to_string(), "550 5.1.1 User unknown <a@b.c>");
        assert!(!reject.is_temporary());

        let plain = RejectError::plain(451, "Try again");
        assert_eq!(plain.reply().to_string(), "451 4.0.0 Try again");
        assert!(plain.is_temporary());
    }

    #[test]
    fn local_error_hides_detail_from_client() {
        let err = LocalMailSystemError::new(EnhancedStatus::MAIL_SYSTEM_FULL, "2000 mails queued");
        assert_eq!(err.reply().to_string(), "452 4.3.1 Mail system full");
        assert!(err.to_string().contains("2000 mails queued"));
        assert!(err.is_temporary());
    }

    #[test]
    fn session_error_classification() {
        assert!(SessionError::Shutdown.is_shutdown());
        assert!(SessionError::Timeout(30).is_client_error());
        assert!(!SessionError::Protocol(String::from("bad")).is_shutdown());
    }

    #[test]
    fn listener_error_keeps_source() {
        let err = ListenerError::BindFailed {
            address: String::from("0.0.0.0:25"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "access denied"),
        };
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "Failed to bind to 0.0.0.0:25: access denied");
    }

    #[test]
    fn canned_replies() {
        assert_eq!(
            configuration_reply().to_string(),
            "554 5.3.0 Mail server configuration is wrong"
        );
        assert_eq!(internal_error_reply().to_string(), "550 Internal error");
    }
}
