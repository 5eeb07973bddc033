use async_trait::async_trait;

use crate::{error::LocalMailSystemError, mail::Mail};

/// Accepts a mail for asynchronous delivery.
///
/// Returning `Ok` means the mail has been stored durably and responsibility
/// for it has been taken over.
#[async_trait]
pub trait Transmitter: Send + Sync {
    async fn transmit(&self, mail: Mail) -> Result<(), LocalMailSystemError>;
}
