use std::sync::Arc;

use async_trait::async_trait;
use mireka_common::{
    address::Recipient, error::LocalMailSystemError, internal, mail::Mail, status::EnhancedStatus,
    transmitter::Transmitter,
};

use crate::queue::Queue;

/// Accepts mail into an outbound [`Queue`].
///
/// When the queue's sender handles one domain per attempt, a mail is
/// stored as one copy per distinct remote part, in order of first
/// appearance.
pub struct QueuingTransmitter {
    queue: Arc<Queue>,
}

impl QueuingTransmitter {
    #[must_use]
    pub const fn new(queue: Arc<Queue>) -> Self {
        Self { queue }
    }

    fn split_by_remote_part(mail: &Mail) -> Result<Vec<Mail>, LocalMailSystemError> {
        let mut groups: Vec<(String, Vec<Recipient>)> = Vec::new();

        for recipient in &mail.recipients {
            let Some(remote_part) = recipient.remote_part() else {
                internal!(level = ERROR, "Recipient {recipient} has no domain and cannot be sent to a remote host");
                return Err(LocalMailSystemError::new(
                    EnhancedStatus::PERMANENT_INTERNAL_ERROR.with_message("Configuration error"),
                    format!("{recipient} reached a remote transmitter"),
                ));
            };

            let key = remote_part.canonical();
            match groups.iter_mut().find(|(existing, _)| *existing == key) {
                Some((_, recipients)) => recipients.push(recipient.clone()),
                None => groups.push((key, vec![recipient.clone()])),
            }
        }

        Ok(groups
            .into_iter()
            .map(|(_, recipients)| mail.for_recipients(recipients))
            .collect())
    }
}

#[async_trait]
impl Transmitter for QueuingTransmitter {
    async fn transmit(&self, mail: Mail) -> Result<(), LocalMailSystemError> {
        let mails = if self.queue.single_domain_only() {
            Self::split_by_remote_part(&mail)?
        } else {
            vec![mail]
        };

        for mail in &mails {
            self.queue.add(mail).await?;
        }
        Ok(())
    }
}
