//! Outbound side of the MTA.
//!
//! Mails accepted by a [`QueuingTransmitter`] are stored in a [`Queue`],
//! delivered by an [`ImmediateSender`] and retried under a
//! [`RetryPolicy`]. Senders are told about failures with delivery status
//! notifications.

pub mod delivery;
pub mod dns;
pub mod dsn;
pub mod error;
pub mod name;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod sender;
pub mod store;
pub mod transmitter;

pub use delivery::{DeliveryProcessor, Outcome};
pub use dns::{DnsConfig, DnsResolver, MailExchangerResolver, StaticResolver};
pub use dsn::{DsnComposer, DsnConfig};
pub use error::{Failure, QueueError, RemoteMta, SendError};
pub use name::MailName;
pub use queue::{Queue, QueueConfig};
pub use registry::OutgoingConnections;
pub use retry::RetryPolicy;
pub use sender::{DirectConfig, DirectSender, ImmediateSender, MailToHost, SmarthostSender, Upstream};
pub use transmitter::QueuingTransmitter;
