use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use mireka_common::{
    mail::MailData,
    status::{EnhancedStatus, Reply},
};

use crate::command::MailParameters;

/// What is known about the connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    /// The name this server announces itself as.
    pub server_name: Arc<str>,
    pub helo: Option<String>,
    pub extended: bool,
}

impl SessionInfo {
    #[must_use]
    pub fn new(peer: SocketAddr, server_name: impl Into<Arc<str>>) -> Self {
        Self {
            peer,
            server_name: server_name.into(),
            helo: None,
            extended: false,
        }
    }
}

/// Receives the events of exactly one mail transaction.
///
/// A handler is created on `MAIL FROM`. [`done`](Self::done) is called once
/// when the transaction ends for any reason: completed DATA, RSET, a new
/// HELO, QUIT, a rejected MAIL, or a lost connection.
///
/// A rejection is returned as the reply the client should see.
#[async_trait]
pub trait TransactionHandler: Send {
    async fn mail_from(
        &mut self,
        reverse_path: &str,
        parameters: &MailParameters,
    ) -> Result<(), Reply>;

    async fn rcpt_to(&mut self, forward_path: &str) -> Result<(), Reply>;

    async fn data(&mut self, data: MailData) -> Result<(), Reply>;

    async fn done(&mut self);
}

pub trait TransactionHandlerFactory: Send + Sync {
    fn create(&self, session: &SessionInfo) -> Box<dyn TransactionHandler>;
}

/// Refuses every transaction. Used when a port is served without anything
/// to hand its mail to.
pub struct RefuseAll;

#[async_trait]
impl TransactionHandler for RefuseAll {
    async fn mail_from(&mut self, _: &str, _: &MailParameters) -> Result<(), Reply> {
        Err(EnhancedStatus::TRANSIENT_SYSTEM_NOT_ACCEPTING.reply())
    }

    async fn rcpt_to(&mut self, _: &str) -> Result<(), Reply> {
        Err(EnhancedStatus::TRANSIENT_SYSTEM_NOT_ACCEPTING.reply())
    }

    async fn data(&mut self, _: MailData) -> Result<(), Reply> {
        Err(EnhancedStatus::TRANSIENT_SYSTEM_NOT_ACCEPTING.reply())
    }

    async fn done(&mut self) {}
}

impl TransactionHandlerFactory for RefuseAll {
    fn create(&self, _: &SessionInfo) -> Box<dyn TransactionHandler> {
        Box::new(Self)
    }
}
