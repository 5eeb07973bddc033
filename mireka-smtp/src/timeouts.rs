//! Timeouts for both ends of an SMTP conversation.
//!
//! Server side values follow RFC 5321 section 4.5.3.2. The client side is
//! shorter so a dead backend or destination host is detected quickly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeouts applied while receiving mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTimeouts {
    /// Waiting for the next command.
    #[serde(default = "defaults::server_command_secs")]
    pub command_secs: u64,

    /// Waiting for each line of message content.
    #[serde(default = "defaults::server_data_block_secs")]
    pub data_block_secs: u64,

    /// Maximum lifetime of a connection.
    #[serde(default = "defaults::server_connection_secs")]
    pub connection_secs: u64,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: defaults::server_command_secs(),
            data_block_secs: defaults::server_data_block_secs(),
            connection_secs: defaults::server_connection_secs(),
        }
    }
}

/// Timeouts applied while sending mail to another server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTimeouts {
    #[serde(default = "defaults::client_connect_secs")]
    pub connect_secs: u64,

    /// Greeting, EHLO, MAIL, RCPT and the DATA command itself.
    #[serde(default = "defaults::client_command_secs")]
    pub command_secs: u64,

    /// Transferring the content and waiting for the final reply.
    #[serde(default = "defaults::client_data_secs")]
    pub data_secs: u64,

    #[serde(default = "defaults::client_quit_secs")]
    pub quit_secs: u64,
}

impl ClientTimeouts {
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub const fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    #[must_use]
    pub const fn data(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }

    #[must_use]
    pub const fn quit(&self) -> Duration {
        Duration::from_secs(self.quit_secs)
    }
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::client_connect_secs(),
            command_secs: defaults::client_command_secs(),
            data_secs: defaults::client_data_secs(),
            quit_secs: defaults::client_quit_secs(),
        }
    }
}

mod defaults {
    pub const fn server_command_secs() -> u64 {
        300
    }

    pub const fn server_data_block_secs() -> u64 {
        180
    }

    pub const fn server_connection_secs() -> u64 {
        1800
    }

    pub const fn client_connect_secs() -> u64 {
        30
    }

    pub const fn client_command_secs() -> u64 {
        60
    }

    pub const fn client_data_secs() -> u64 {
        600
    }

    pub const fn client_quit_secs() -> u64 {
        10
    }
}
