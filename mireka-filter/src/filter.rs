use async_trait::async_trait;

use crate::{
    error::FilterError,
    transaction::{MailTransaction, RecipientContext},
};

/// Outcome of [`FilterSession::verify_recipient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReply {
    /// The recipient is accepted; later stages are not asked.
    Accept,
    /// No opinion, ask the next stage.
    Neutral,
}

/// The per-transaction instance of a [`Filter`].
///
/// Every hook has a no-op default, so a stage only implements what it acts
/// on. Returning an error stops the chain for that command.
#[async_trait]
pub trait FilterSession: Send {
    async fn begin(&mut self, _tx: &mut MailTransaction) -> Result<(), FilterError> {
        Ok(())
    }

    /// Called once the reverse path is in `tx.from`.
    async fn from(&mut self, _tx: &mut MailTransaction) -> Result<(), FilterError> {
        Ok(())
    }

    async fn verify_recipient(
        &mut self,
        _tx: &MailTransaction,
        _ctx: &mut RecipientContext,
    ) -> Result<FilterReply, FilterError> {
        Ok(FilterReply::Neutral)
    }

    /// Called for every recipient that passed verification.
    async fn recipient(
        &mut self,
        _tx: &MailTransaction,
        _ctx: &mut RecipientContext,
    ) -> Result<(), FilterError> {
        Ok(())
    }

    /// Called once the content is in `tx.data`, which may be replaced.
    async fn data(&mut self, _tx: &mut MailTransaction) -> Result<(), FilterError> {
        Ok(())
    }

    /// Always called at the end of the transaction.
    async fn done(&mut self, _tx: &MailTransaction) -> Result<(), FilterError> {
        Ok(())
    }
}

/// A configured filter stage.
pub trait Filter: Send + Sync {
    fn instance(&self) -> Box<dyn FilterSession>;
}
