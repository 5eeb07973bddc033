//! The last stage of a filter chain: hands each accepted recipient to its
//! destination.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use mireka_common::{
    address::Recipient,
    error::{ConfigurationError, RejectError},
    internal,
    status::EnhancedCode,
};

use crate::{
    destination::{Destination, DestinationSession},
    error::FilterError,
    filter::{Filter, FilterSession},
    relay::RelaySession,
    transaction::{MailTransaction, RecipientContext},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct DestinationProcessor;

impl Filter for DestinationProcessor {
    fn instance(&self) -> Box<dyn FilterSession> {
        Box::new(DestinationProcessorSession::default())
    }
}

/// The recipients of one destination within a transaction.
struct Group {
    destination: Destination,
    recipients: Vec<Recipient>,
    session: Option<Box<dyn DestinationSession>>,
}

impl Group {
    const fn new(destination: Destination) -> Self {
        Self {
            destination,
            recipients: Vec::new(),
            session: None,
        }
    }

    /// Creates the destination session if the destination has one, and
    /// tells it the sender.
    async fn session(
        &mut self,
        tx: &MailTransaction,
    ) -> Result<Option<&mut Box<dyn DestinationSession>>, FilterError> {
        if self.session.is_none() {
            let session: Box<dyn DestinationSession> = match &self.destination {
                Destination::Session(named) => named.inner.session(),
                Destination::Relay(server) => Box::new(RelaySession::new(Arc::clone(server))),
                _ => return Ok(None),
            };
            let session = self.session.insert(session);
            session.from(&tx.from).await?;
        }
        Ok(self.session.as_mut())
    }
}

#[derive(Default)]
pub struct DestinationProcessorSession {
    groups: IndexMap<String, Group>,
}

#[async_trait]
impl FilterSession for DestinationProcessorSession {
    async fn recipient(
        &mut self,
        tx: &MailTransaction,
        ctx: &mut RecipientContext,
    ) -> Result<(), FilterError> {
        let destination = match ctx.destination() {
            Some(Destination::UnknownRecipient) => {
                return Err(RejectError::new(
                    550,
                    EnhancedCode::new(5, 1, 1),
                    format!("User unknown <{}>", ctx.recipient),
                )
                .into());
            }
            Some(Destination::Alias(_)) => {
                return Err(ConfigurationError(format!(
                    "Alias destination of {} was never resolved",
                    ctx.recipient
                ))
                .into());
            }
            Some(destination) => destination.clone(),
            None => {
                return Err(ConfigurationError(format!(
                    "No destination assigned to {}",
                    ctx.recipient
                ))
                .into());
            }
        };

        let group = self
            .groups
            .entry(destination.key())
            .or_insert_with(|| Group::new(destination));

        if let Some(session) = group.session(tx).await? {
            session.recipient(&ctx.recipient).await?;
        }

        group.recipients.push(ctx.recipient.clone());
        ctx.transfer_responsibility();
        Ok(())
    }

    async fn data(&mut self, tx: &mut MailTransaction) -> Result<(), FilterError> {
        for (key, group) in &mut self.groups {
            if group.recipients.is_empty() {
                internal!(level = DEBUG, "No recipients left for {key}, skipping");
                continue;
            }

            let mail = tx.mail_for(group.recipients.clone());
            internal!(
                level = DEBUG,
                "Passing mail {} with {} recipient(s) to {key}",
                tx.log_id,
                mail.recipients.len()
            );

            match &group.destination {
                Destination::Mail(named) => named.inner.data(mail).await?,
                Destination::Transmit(named) => named.inner.transmit(mail).await?,
                Destination::Session(_) | Destination::Relay(_) => {
                    if let Some(session) = group.session.as_mut() {
                        session.data(mail).await?;
                    }
                }
                Destination::Null => {
                    internal!("Dropping mail {} for {key}", tx.log_id);
                }
                Destination::Alias(_) | Destination::UnknownRecipient => {
                    return Err(ConfigurationError(format!(
                        "{key} cannot receive mail"
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    async fn done(&mut self, tx: &MailTransaction) -> Result<(), FilterError> {
        for (key, group) in &mut self.groups {
            if let Some(session) = group.session.as_mut()
                && let Err(err) = session.done().await
            {
                internal!(
                    level = WARN,
                    "Destination {key} failed to finish transaction {}: {err}",
                    tx.log_id
                );
            }
        }
        Ok(())
    }
}
