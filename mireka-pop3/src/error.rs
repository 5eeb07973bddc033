use std::{io, path::Path};

use thiserror::Error;

/// Failures of the on-disk maildrop.
#[derive(Debug, Error)]
pub enum MaildropError {
    #[error("{operation} {path} failed: {source}")]
    Io {
        operation: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Maildrop is corrupt: {0}")]
    Corrupt(String),
}

impl MaildropError {
    pub(crate) fn io(operation: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.display().to_string();
        move |source| Self::Io {
            operation,
            path,
            source,
        }
    }
}

/// A negative POP3 response, optionally with an RFC 2449 response code.
#[derive(Debug, Error)]
pub enum Pop3Error {
    #[error("{0}")]
    Syntax(&'static str),

    #[error("Command is not implemented")]
    UnknownCommand,

    #[error("Command is not valid in this state")]
    IllegalState,

    #[error("No such message")]
    NoSuchMessage,

    #[error("Deleted message")]
    DeletedMessage,

    #[error("Invalid user and password combination")]
    Authentication,

    #[error("Maildrop is already locked")]
    Locked,

    #[error("Corrupted mailbox")]
    Maildrop(#[from] MaildropError),

    #[error("Cannot remove {0} deleted mails")]
    Deletion(usize),
}

impl Pop3Error {
    /// The extended response code (RFC 2449, RFC 3206).
    #[must_use]
    pub const fn response_code(&self) -> Option<&'static str> {
        match self {
            Self::Authentication => Some("AUTH"),
            Self::Locked => Some("IN-USE"),
            Self::Maildrop(_) | Self::Deletion(_) => Some("SYS/PERM"),
            Self::Syntax(_)
            | Self::UnknownCommand
            | Self::IllegalState
            | Self::NoSuchMessage
            | Self::DeletedMessage => None,
        }
    }

    /// The complete `-ERR` line, without CRLF.
    #[must_use]
    pub fn response(&self) -> String {
        match self.response_code() {
            Some(code) => format!("-ERR [{code}] {self}"),
            None => format!("-ERR {self}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses() {
        assert_eq!(Pop3Error::Locked.response(), "-ERR [IN-USE] Maildrop is already locked");
        assert_eq!(Pop3Error::NoSuchMessage.response(), "-ERR No such message");
        assert_eq!(
            Pop3Error::Maildrop(MaildropError::Corrupt(String::from("bad uid file"))).response(),
            "-ERR [SYS/PERM] Corrupted mailbox"
        );
    }
}
