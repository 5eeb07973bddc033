//! Mailing lists: mail sent to a list address is checked and sent on to
//! every member through the outbound queue.

pub mod destination;
pub mod dmarc;
pub mod error;
pub mod headers;
pub mod subject;

pub use destination::{ListConfig, ListDestination, ListMember};
pub use dmarc::{DnsPolicySource, Policy, PolicySource};
pub use error::ListError;
