//! The mail transaction as seen by the configured filters, and the
//! destinations accepted mail is handed to.

pub mod builtin;
pub mod chain;
pub mod destination;
pub mod error;
pub mod filter;
pub mod handler;
pub mod mapper;
pub mod processor;
pub mod relay;
pub mod transaction;

pub use chain::FilterChain;
pub use destination::{Destination, DestinationSession, MailDestination, Named, SessionDestination};
pub use error::FilterError;
pub use filter::{Filter, FilterReply, FilterSession};
pub use handler::FilterChainHandlerFactory;
pub use mapper::{DestinationMapper, RecipientSpecification};
pub use processor::DestinationProcessor;
pub use transaction::{MailTransaction, RecipientContext};
