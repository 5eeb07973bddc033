use std::sync::Arc;

use async_trait::async_trait;
use mireka_common::{
    address::{Recipient, ReversePath},
    error::RejectError,
    internal,
    mail::Mail,
    status::EnhancedCode,
};

use super::{BackendClient, BackendServer};
use crate::{destination::DestinationSession, error::FilterError};

/// Relays the recipients of one transaction that go to one backend.
///
/// The connection is opened on the first recipient. Failures to open it or
/// to send the sender are reported on each recipient.
pub struct RelaySession {
    client: BackendClient,
    reverse_path: ReversePath,
    started: bool,
}

impl RelaySession {
    #[must_use]
    pub const fn new(server: Arc<BackendServer>) -> Self {
        Self {
            client: BackendClient::new(server),
            reverse_path: ReversePath::Null,
            started: false,
        }
    }

    async fn start(&mut self) {
        self.started = true;
        if self.client.connect().await.is_ok()
            && let Err(err) = self.client.from(&self.reverse_path).await
        {
            // Kept by the client and returned for every recipient.
            internal!(
                level = DEBUG,
                "Backend {} refused sender {}: {err}",
                self.client.server().host,
                self.reverse_path
            );
        }
    }
}

#[async_trait]
impl DestinationSession for RelaySession {
    async fn from(&mut self, reverse_path: &ReversePath) -> Result<(), FilterError> {
        self.reverse_path = reverse_path.clone();
        Ok(())
    }

    async fn recipient(&mut self, recipient: &Recipient) -> Result<(), FilterError> {
        if !self.started {
            self.start().await;
        }
        Ok(self.client.recipient(recipient).await?)
    }

    async fn data(&mut self, mail: Mail) -> Result<(), FilterError> {
        if !self.client.has_accepted_recipient() {
            return Err(RejectError::new(554, EnhancedCode::new(5, 5, 1), "No valid recipients").into());
        }
        Ok(self.client.data(&mail.data).await?)
    }

    async fn done(&mut self) -> Result<(), FilterError> {
        if self.started {
            internal!(
                level = DEBUG,
                "Closing backend connection to {}",
                self.client.server().host
            );
        }
        self.client.quit().await;
        Ok(())
    }
}
