pub mod client;
pub mod command;
pub mod connection;
pub mod handler;
pub mod session;
pub mod state;
pub mod timeouts;

use std::{collections::HashMap, fmt, net::SocketAddr, sync::Arc};

use mireka_common::{
    Signal,
    error::{ProtocolError, SessionError},
    traits::protocol::{Protocol, SessionHandler},
    tracing,
};
use mireka_tracing::traced;
use serde::Deserialize;
use tokio::{net::TcpStream, sync::broadcast::Receiver};

pub use crate::{
    handler::{SessionInfo, TransactionHandler, TransactionHandlerFactory},
    state::State,
    timeouts::{ClientTimeouts, ServerTimeouts},
};
use crate::session::{Session, SessionConfig};

#[derive(Default, Deserialize)]
pub struct Smtp;

/// Listener arguments of an SMTP port.
#[derive(Clone, Default, Deserialize)]
pub struct SmtpArgs {
    /// Name announced in the greeting. Defaults to `$HOSTNAME`.
    #[serde(default)]
    banner: Option<String>,
    /// Largest accepted message in bytes, 0 for no limit.
    #[serde(default)]
    max_message_size: usize,
    #[serde(default)]
    timeouts: ServerTimeouts,
    #[serde(skip)]
    handler: Option<Arc<dyn TransactionHandlerFactory>>,
}

impl fmt::Debug for SmtpArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpArgs")
            .field("banner", &self.banner)
            .field("max_message_size", &self.max_message_size)
            .field("timeouts", &self.timeouts)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl SmtpArgs {
    #[must_use]
    pub fn builder() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = Some(banner.into());
        self
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: ServerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set what receives the mail transactions of this port
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn TransactionHandlerFactory>) -> Self {
        self.handler = Some(handler);
        self
    }
}

impl Protocol for Smtp {
    type Session = Session<TcpStream>;
    type Args = SmtpArgs;

    fn ty() -> &'static str {
        "SMTP"
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip(self, stream, _context, args)), timing(precision = "ms"))]
    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        _context: HashMap<String, String>,
        args: Self::Args,
    ) -> Self::Session {
        // `validate` guarantees a handler; a listener that skipped it refuses
        // every transaction.
        let handler = args
            .handler
            .unwrap_or_else(|| Arc::new(handler::RefuseAll) as Arc<dyn TransactionHandlerFactory>);

        let mut config = SessionConfig::new(handler)
            .with_max_message_size(args.max_message_size)
            .with_timeouts(args.timeouts);
        if let Some(banner) = args.banner {
            config = config.with_banner(banner);
        }

        Session::create(stream, peer, config)
    }

    #[traced(instrument(skip(self, args)), timing(precision = "ns"))]
    fn validate(&self, args: &Self::Args) -> Result<(), ProtocolError> {
        if args.handler.is_none() {
            return Err(ProtocolError::MissingField("handler"));
        }

        if args.timeouts.command_secs == 0 || args.timeouts.data_block_secs == 0 {
            return Err(ProtocolError::InvalidConfiguration {
                field: String::from("timeouts"),
                reason: String::from("timeouts must be greater than zero"),
            });
        }

        Ok(())
    }
}

impl SessionHandler for Session<TcpStream> {
    async fn run(self, signal: Receiver<Signal>) -> Result<(), SessionError> {
        Self::run(self, signal).await
    }
}
