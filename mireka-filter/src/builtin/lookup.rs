use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    destination::Destination,
    error::FilterError,
    filter::{Filter, FilterReply, FilterSession},
    mapper::DestinationMapper,
    transaction::{MailTransaction, RecipientContext},
};

/// Assigns destinations from the mapping table, following aliases.
///
/// A destination assigned by an earlier stage is kept, unless it is an
/// alias, which is then resolved.
#[derive(Clone)]
pub struct LookupDestination {
    mapper: Arc<DestinationMapper>,
}

impl LookupDestination {
    #[must_use]
    pub const fn new(mapper: Arc<DestinationMapper>) -> Self {
        Self { mapper }
    }
}

#[async_trait]
impl FilterSession for LookupDestination {
    async fn verify_recipient(
        &mut self,
        _tx: &MailTransaction,
        ctx: &mut RecipientContext,
    ) -> Result<FilterReply, FilterError> {
        let destination = match ctx.destination() {
            None => self.mapper.resolve(&ctx.recipient)?,
            Some(Destination::Alias(target)) => self.mapper.resolve(target)?,
            Some(_) => return Ok(FilterReply::Neutral),
        };
        ctx.set_destination(destination);
        Ok(FilterReply::Neutral)
    }
}

impl Filter for LookupDestination {
    fn instance(&self) -> Box<dyn FilterSession> {
        Box::new(self.clone())
    }
}
