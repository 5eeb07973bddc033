//! Where the mail of an accepted recipient goes.
//!
//! A [`Destination`] is a plain value. Recipients sharing a destination are
//! recognised by [`Destination::key`] and are served by a single invocation
//! at DATA time.

use std::{
    fmt::{self, Debug, Display, Formatter},
    sync::Arc,
};

use async_trait::async_trait;
use mireka_common::{
    address::{Recipient, ReversePath},
    mail::Mail,
    transmitter::Transmitter,
};

use crate::{error::FilterError, relay::BackendServer};

/// A destination that takes the complete mail in one call.
#[async_trait]
pub trait MailDestination: Send + Sync {
    async fn data(&self, mail: Mail) -> Result<(), FilterError>;
}

/// A destination that follows the transaction step by step.
pub trait SessionDestination: Send + Sync {
    fn session(&self) -> Box<dyn DestinationSession>;
}

/// Per-transaction state of a [`SessionDestination`].
///
/// `from` is called exactly once before the first `recipient`, `data` at
/// most once, and `done` always once at the end of the transaction.
#[async_trait]
pub trait DestinationSession: Send {
    async fn from(&mut self, reverse_path: &ReversePath) -> Result<(), FilterError>;

    async fn recipient(&mut self, recipient: &Recipient) -> Result<(), FilterError>;

    async fn data(&mut self, mail: Mail) -> Result<(), FilterError>;

    async fn done(&mut self) -> Result<(), FilterError>;
}

/// A configured object together with the name it was configured under.
pub struct Named<T: ?Sized> {
    pub name: Arc<str>,
    pub inner: Arc<T>,
}

impl<T: ?Sized> Named<T> {
    pub fn new(name: impl Into<Arc<str>>, inner: Arc<T>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }
}

impl<T: ?Sized> Clone for Named<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Clone)]
pub enum Destination {
    /// Not a final destination: the recipient is looked up again.
    Alias(Recipient),
    Mail(Named<dyn MailDestination>),
    Session(Named<dyn SessionDestination>),
    /// Proxied to a backend server within the SMTP transaction.
    Relay(Arc<BackendServer>),
    /// Handed to an outbound queue.
    Transmit(Named<dyn Transmitter>),
    /// Accepted and dropped.
    Null,
    UnknownRecipient,
}

impl Destination {
    /// Identity used to group recipients.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Alias(recipient) => format!("alias:{}", recipient.canonical()),
            Self::Mail(named) => format!("mail:{}", named.name),
            Self::Session(named) => format!("session:{}", named.name),
            Self::Relay(server) => format!("relay:{}:{}", server.host.to_ascii_lowercase(), server.port),
            Self::Transmit(named) => format!("transmit:{}", named.name),
            Self::Null => String::from("null"),
            Self::UnknownRecipient => String::from("unknown"),
        }
    }

    /// Whether mail can actually be handed to this destination.
    #[must_use]
    pub const fn is_responsible(&self) -> bool {
        !matches!(self, Self::Alias(_) | Self::UnknownRecipient)
    }
}

impl PartialEq for Destination {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Destination {}

impl Display for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl Debug for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Destination({})", self.key())
    }
}
