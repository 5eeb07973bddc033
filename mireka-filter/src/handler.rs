use std::sync::Arc;

use async_trait::async_trait;
use mireka_common::{
    address::{parse_forward_path, parse_reverse_path},
    error::{ConfigurationError, RejectError},
    internal,
    mail::MailData,
    status::{EnhancedCode, EnhancedStatus, Reply, Status},
    tracing,
};
use mireka_smtp::{
    SessionInfo, TransactionHandler, TransactionHandlerFactory, command::MailParameters,
};
use mireka_tracing::traced;

use crate::{
    chain::{ChainSession, FilterChain},
    error::FilterError,
    filter::{FilterReply, FilterSession},
    transaction::{MailTransaction, RecipientContext},
};

/// Runs SMTP transactions through a [`FilterChain`].
#[derive(Clone)]
pub struct FilterChainHandlerFactory {
    chain: Arc<FilterChain>,
}

impl FilterChainHandlerFactory {
    #[must_use]
    pub const fn new(chain: Arc<FilterChain>) -> Self {
        Self { chain }
    }
}

impl TransactionHandlerFactory for FilterChainHandlerFactory {
    fn create(&self, session: &SessionInfo) -> Box<dyn TransactionHandler> {
        Box::new(FilterChainHandler::new(&self.chain, session.clone()))
    }
}

pub struct FilterChainHandler {
    chain: ChainSession,
    tx: MailTransaction,
    begun: bool,
}

impl FilterChainHandler {
    #[must_use]
    pub fn new(chain: &FilterChain, session: SessionInfo) -> Self {
        Self {
            chain: chain.instance(),
            tx: MailTransaction::new(session),
            begun: false,
        }
    }

    #[must_use]
    pub const fn transaction(&self) -> &MailTransaction {
        &self.tx
    }

    fn user_unknown(ctx: &RecipientContext) -> Reply {
        Reply::enhanced(
            Status::Error,
            EnhancedCode::new(5, 1, 1),
            format!("User unknown <{}>", ctx.recipient),
        )
    }

    /// A recipient is accepted when a stage said so, or when it ended up
    /// with a destination able to take its mail.
    fn is_accepted(reply: FilterReply, ctx: &RecipientContext) -> bool {
        reply == FilterReply::Accept || ctx.destination().is_some_and(|d| d.is_responsible())
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip_all, fields(log_id = %self.tx.log_id)), timing(precision = "ms"))]
    async fn process_data(&mut self, data: MailData) -> Result<(), FilterError> {
        if self.tx.recipients.is_empty() {
            return Err(
                RejectError::new(554, EnhancedCode::new(5, 5, 1), "No valid recipients").into(),
            );
        }
        self.tx.data = Some(data);
        self.chain.data(&mut self.tx).await?;

        if let Some(ctx) = self
            .tx
            .recipients
            .iter()
            .find(|ctx| !ctx.is_responsibility_transferred())
        {
            return Err(ConfigurationError(format!(
                "Nothing took responsibility for recipient {}, check the filter chain",
                ctx.recipient
            ))
            .into());
        }

        internal!(
            level = INFO,
            "Accepted mail {} from <{}> for {} recipient(s)",
            self.tx.log_id,
            self.tx.from,
            self.tx.recipients.len()
        );
        Ok(())
    }
}

#[async_trait]
impl TransactionHandler for FilterChainHandler {
    async fn mail_from(&mut self, reverse_path: &str, _: &MailParameters) -> Result<(), Reply> {
        self.tx.from = parse_reverse_path(reverse_path).map_err(|err| {
            internal!(level = DEBUG, "Bad reverse path {reverse_path}: {err}");
            Reply::enhanced(
                Status::ParameterSyntaxError,
                EnhancedCode::new(5, 1, 7),
                "Bad sender address syntax",
            )
        })?;

        if !self.begun {
            self.begun = true;
            self.chain.begin(&mut self.tx).await.map_err(|err| err.reply())?;
        }
        self.chain.from(&mut self.tx).await.map_err(|err| err.reply())
    }

    async fn rcpt_to(&mut self, forward_path: &str) -> Result<(), Reply> {
        let recipient = parse_forward_path(forward_path).map_err(|err| {
            internal!(level = DEBUG, "Bad forward path {forward_path}: {err}");
            EnhancedStatus::BAD_DESTINATION_MAILBOX_SYNTAX.reply()
        })?;
        let mut ctx = RecipientContext::new(recipient);

        let reply = self
            .chain
            .verify_recipient(&self.tx, &mut ctx)
            .await
            .map_err(|err| rejected(&self.tx, &ctx, &err))?;

        if !Self::is_accepted(reply, &ctx) {
            internal!(
                level = INFO,
                "Transaction {}: unknown recipient {}",
                self.tx.log_id,
                ctx.recipient
            );
            return Err(Self::user_unknown(&ctx));
        }

        self.chain
            .recipient(&self.tx, &mut ctx)
            .await
            .map_err(|err| rejected(&self.tx, &ctx, &err))?;

        self.tx.recipients.push(ctx);
        Ok(())
    }

    async fn data(&mut self, data: MailData) -> Result<(), Reply> {
        self.process_data(data).await.map_err(|err| {
            internal!(
                level = INFO,
                "Mail {} was not accepted: {err}",
                self.tx.log_id
            );
            err.reply()
        })
    }

    async fn done(&mut self) {
        if let Err(err) = self.chain.done(&self.tx).await {
            internal!(level = WARN, "Failed to finish transaction {}: {err}", self.tx.log_id);
        }
    }
}

fn rejected(tx: &MailTransaction, ctx: &RecipientContext, err: &FilterError) -> Reply {
    internal!(
        level = INFO,
        "Transaction {}: recipient {} rejected: {err}",
        tx.log_id,
        ctx.recipient
    );
    err.reply()
}
