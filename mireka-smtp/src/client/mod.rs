//! The sending side of SMTP, used to relay to a backend server and to
//! transmit queued mail to remote hosts.

mod client;
mod error;
mod response;

pub use client::SmtpClient;
pub use error::{ClientError, Result};
pub use response::Response;
