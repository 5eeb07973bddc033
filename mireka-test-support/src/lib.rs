//! Test doubles used by the integration tests of several crates.

pub mod mock_server;

pub use mock_server::{MockSmtpServer, MockSmtpServerBuilder, SmtpCommand};
