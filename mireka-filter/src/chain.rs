use std::sync::Arc;

use async_trait::async_trait;
use mireka_common::internal;

use crate::{
    error::FilterError,
    filter::{Filter, FilterReply, FilterSession},
    transaction::{MailTransaction, RecipientContext},
};

/// The ordered list of configured filter stages.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    #[must_use]
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self { filters }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Instantiates every stage for a new transaction.
    #[must_use]
    pub fn instance(&self) -> ChainSession {
        ChainSession {
            stages: self.filters.iter().map(|filter| filter.instance()).collect(),
        }
    }
}

/// Drives the stages of one transaction in order.
pub struct ChainSession {
    stages: Vec<Box<dyn FilterSession>>,
}

#[async_trait]
impl FilterSession for ChainSession {
    async fn begin(&mut self, tx: &mut MailTransaction) -> Result<(), FilterError> {
        for stage in &mut self.stages {
            stage.begin(tx).await?;
        }
        Ok(())
    }

    async fn from(&mut self, tx: &mut MailTransaction) -> Result<(), FilterError> {
        for stage in &mut self.stages {
            stage.from(tx).await?;
        }
        Ok(())
    }

    async fn verify_recipient(
        &mut self,
        tx: &MailTransaction,
        ctx: &mut RecipientContext,
    ) -> Result<FilterReply, FilterError> {
        for stage in &mut self.stages {
            if stage.verify_recipient(tx, ctx).await? == FilterReply::Accept {
                return Ok(FilterReply::Accept);
            }
        }
        Ok(FilterReply::Neutral)
    }

    async fn recipient(
        &mut self,
        tx: &MailTransaction,
        ctx: &mut RecipientContext,
    ) -> Result<(), FilterError> {
        for stage in &mut self.stages {
            stage.recipient(tx, ctx).await?;
        }
        Ok(())
    }

    async fn data(&mut self, tx: &mut MailTransaction) -> Result<(), FilterError> {
        for stage in &mut self.stages {
            stage.data(tx).await?;
        }
        Ok(())
    }

    /// Runs every stage's `done`, whatever the others return.
    async fn done(&mut self, tx: &MailTransaction) -> Result<(), FilterError> {
        for (index, stage) in self.stages.iter_mut().enumerate() {
            if let Err(err) = stage.done(tx).await {
                internal!(
                    level = WARN,
                    "Filter stage {index} failed to finish transaction {}: {err}",
                    tx.log_id
                );
            }
        }
        Ok(())
    }
}
