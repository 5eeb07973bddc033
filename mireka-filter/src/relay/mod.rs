//! Proxying recipients to backend SMTP servers within the inbound
//! transaction.

mod backend;
mod client;
mod session;

pub use backend::BackendServer;
pub use client::BackendClient;
pub use session::RelaySession;
