use std::sync::Arc;

use async_trait::async_trait;
use mireka_common::{
    address::{RemotePart, ReversePath},
    error::RejectError,
    internal,
    status::EnhancedCode,
};

use crate::{
    destination::Destination,
    error::FilterError,
    filter::{Filter, FilterReply, FilterSession},
    transaction::{MailTransaction, RecipientContext},
};

fn user_unknown(ctx: &RecipientContext) -> FilterError {
    RejectError::new(
        550,
        EnhancedCode::new(5, 1, 1),
        format!("User unknown <{}>", ctx.recipient),
    )
    .into()
}

/// Rejects recipients mapped to [`Destination::UnknownRecipient`] at RCPT
/// time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefuseUnknownRecipient;

#[async_trait]
impl FilterSession for RefuseUnknownRecipient {
    async fn verify_recipient(
        &mut self,
        _tx: &MailTransaction,
        ctx: &mut RecipientContext,
    ) -> Result<FilterReply, FilterError> {
        if ctx.destination() == Some(&Destination::UnknownRecipient) {
            return Err(user_unknown(ctx));
        }
        Ok(FilterReply::Neutral)
    }
}

impl Filter for RefuseUnknownRecipient {
    fn instance(&self) -> Box<dyn FilterSession> {
        Box::new(*self)
    }
}

/// Only accepts recipients in local domains. The global postmaster is
/// always local.
#[derive(Debug, Clone)]
pub struct ProhibitRelaying {
    local_domains: Arc<[RemotePart]>,
}

impl ProhibitRelaying {
    #[must_use]
    pub fn new(local_domains: Vec<RemotePart>) -> Self {
        Self {
            local_domains: local_domains.into(),
        }
    }
}

#[async_trait]
impl FilterSession for ProhibitRelaying {
    async fn verify_recipient(
        &mut self,
        _tx: &MailTransaction,
        ctx: &mut RecipientContext,
    ) -> Result<FilterReply, FilterError> {
        let Some(remote_part) = ctx.recipient.remote_part() else {
            return Ok(FilterReply::Neutral);
        };

        if self.local_domains.contains(remote_part) {
            Ok(FilterReply::Neutral)
        } else {
            Err(RejectError::new(
                550,
                EnhancedCode::new(5, 7, 1),
                format!("Relaying prohibited, user is not local ({})", ctx.recipient),
            )
            .into())
        }
    }
}

impl Filter for ProhibitRelaying {
    fn instance(&self) -> Box<dyn FilterSession> {
        Box::new(self.clone())
    }
}

/// Accepts, without asking later stages, every recipient that has a
/// destination able to take the mail.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptRecipient;

#[async_trait]
impl FilterSession for AcceptRecipient {
    async fn verify_recipient(
        &mut self,
        _tx: &MailTransaction,
        ctx: &mut RecipientContext,
    ) -> Result<FilterReply, FilterError> {
        match ctx.destination() {
            Some(destination) if destination.is_responsible() => Ok(FilterReply::Accept),
            _ => Ok(FilterReply::Neutral),
        }
    }
}

impl Filter for AcceptRecipient {
    fn instance(&self) -> Box<dyn FilterSession> {
        Box::new(*self)
    }
}

/// Sends postmaster mail from particular senders somewhere else, e.g.
/// reports of a feedback loop to the system that processes them.
#[derive(Clone)]
pub struct RedirectPostmasterMail {
    mappings: Arc<[(ReversePath, Destination)]>,
}

impl RedirectPostmasterMail {
    #[must_use]
    pub fn new(mappings: Vec<(ReversePath, Destination)>) -> Self {
        Self {
            mappings: mappings.into(),
        }
    }
}

#[async_trait]
impl FilterSession for RedirectPostmasterMail {
    async fn verify_recipient(
        &mut self,
        tx: &MailTransaction,
        ctx: &mut RecipientContext,
    ) -> Result<FilterReply, FilterError> {
        if ctx.is_destination_assigned() || !ctx.recipient.is_postmaster() {
            return Ok(FilterReply::Neutral);
        }

        if let Some((_, destination)) = self.mappings.iter().find(|(sender, _)| *sender == tx.from)
        {
            internal!(
                level = DEBUG,
                "Mail to {} was redirected to {destination}",
                ctx.recipient
            );
            ctx.set_destination(destination.clone());
        }
        Ok(FilterReply::Neutral)
    }
}

impl Filter for RedirectPostmasterMail {
    fn instance(&self) -> Box<dyn FilterSession> {
        Box::new(self.clone())
    }
}
