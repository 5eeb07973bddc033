use std::{
    fmt::{self, Display, Formatter},
    io,
    net::IpAddr,
    time::Duration,
};

use chrono::{DateTime, Utc};
use mireka_common::{address::Recipient, error::LocalMailSystemError, status::EnhancedStatus};
use mireka_smtp::client::Response;
use thiserror::Error;
use ulid::Ulid;

/// A host mail was handed to, or was about to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMta {
    pub dns_name: String,
    pub address: Option<IpAddr>,
}

impl RemoteMta {
    #[must_use]
    pub fn new(dns_name: impl Into<String>, address: Option<IpAddr>) -> Self {
        Self {
            dns_name: dns_name.into(),
            address,
        }
    }
}

impl Display for RemoteMta {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(address) => write!(f, "{} [{address}]", self.dns_name),
            None => f.write_str(&self.dns_name),
        }
    }
}

/// What went wrong with one delivery attempt, with everything a delivery
/// status notification reports about it.
#[derive(Debug, Clone)]
pub struct Failure {
    pub status: EnhancedStatus,
    pub remote_mta: Option<RemoteMta>,
    /// The reply of the remote MTA, when the failure is its verdict.
    pub remote_reply: Option<String>,
    pub date: DateTime<Utc>,
    pub log_id: Ulid,
}

impl Failure {
    #[must_use]
    pub fn new(status: EnhancedStatus) -> Self {
        Self {
            status,
            remote_mta: None,
            remote_reply: None,
            date: Utc::now(),
            log_id: Ulid::new(),
        }
    }

    /// A negative reply of a remote MTA.
    #[must_use]
    pub fn remote(response: &Response, remote_mta: RemoteMta) -> Self {
        let reply = response
            .lines
            .iter()
            .map(|line| format!("{} {line}", response.code))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            remote_mta: Some(remote_mta),
            remote_reply: Some(reply),
            ..Self::new(response.status())
        }
    }

    #[must_use]
    pub fn with_remote_mta(mut self, remote_mta: RemoteMta) -> Self {
        self.remote_mta = Some(remote_mta);
        self
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)?;
        if let Some(remote_mta) = &self.remote_mta {
            write!(f, " (at {remote_mta})")?;
        }
        write!(f, " [{}]", self.log_id)
    }
}

#[derive(Debug, Clone)]
pub struct RecipientRejection {
    pub recipient: Recipient,
    pub failure: Failure,
}

/// Why a mail could not be handed over to the next hop.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("Permanent failure: {0}")]
    Permanent(Failure),

    #[error("Transient failure: {0}")]
    Transient(Failure),

    /// Not a failure of the destination. The attempt should be repeated
    /// shortly without counting it.
    #[error("Postponed by {delay:?}: {failure}")]
    Postpone { failure: Failure, delay: Duration },

    /// The mail went through for every recipient except these.
    #[error("{} recipient(s) rejected", rejections.len())]
    RecipientsRejected { rejections: Vec<RecipientRejection> },
}

impl SendError {
    /// Classifies `failure` by its status.
    #[must_use]
    pub fn failed(failure: Failure) -> Self {
        if failure.status.should_retry() {
            Self::Transient(failure)
        } else {
            Self::Permanent(failure)
        }
    }

    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Postpone { .. })
    }
}

/// Failures of the on-disk queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Mail queue is full, it holds {0} mails")]
    Full(usize),

    #[error("Cannot write {name}: {source}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Cannot read {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Cannot remove {name}: {source}")]
    Remove {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid envelope in {name}: {reason}")]
    Envelope { name: String, reason: String },

    #[error("Queue directory {path} is unusable: {source}")]
    Directory {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl QueueError {
    /// How the failure is reported to whoever tried to queue a mail.
    #[must_use]
    pub fn status(&self) -> EnhancedStatus {
        match self {
            Self::Full(_) => {
                EnhancedStatus::TRANSIENT_SYSTEM_NOT_ACCEPTING.with_message("Mail queue is full")
            }
            Self::Write { .. } => EnhancedStatus::MAIL_SYSTEM_FULL,
            Self::Read { .. } | Self::Remove { .. } | Self::Envelope { .. } | Self::Directory { .. } => {
                EnhancedStatus::TRANSIENT_LOCAL_ERROR
            }
        }
    }
}

impl From<QueueError> for LocalMailSystemError {
    fn from(err: QueueError) -> Self {
        Self::new(err.status(), err.to_string())
    }
}
