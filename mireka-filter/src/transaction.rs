use ahash::AHashMap;
use chrono::{DateTime, Utc};
use mireka_common::{
    address::{Recipient, ReversePath},
    mail::{Mail, MailData, ReceivedFrom},
};
use mireka_smtp::SessionInfo;
use ulid::Ulid;

use crate::destination::Destination;

/// The state of one mail transaction, shared by every filter stage.
#[derive(Debug)]
pub struct MailTransaction {
    pub session: SessionInfo,
    /// Correlates log lines of this transaction.
    pub log_id: Ulid,
    pub from: ReversePath,
    /// Recipients accepted so far, in the order the client sent them.
    pub recipients: Vec<RecipientContext>,
    pub arrival: DateTime<Utc>,
    /// Bound once, when DATA is received. Filters may replace it.
    pub data: Option<MailData>,
    /// Free-form values filters hand to each other.
    pub attributes: AHashMap<String, String>,
}

impl MailTransaction {
    #[must_use]
    pub fn new(session: SessionInfo) -> Self {
        Self {
            session,
            log_id: Ulid::new(),
            from: ReversePath::Null,
            recipients: Vec::new(),
            arrival: Utc::now(),
            data: None,
            attributes: AHashMap::new(),
        }
    }

    #[must_use]
    pub fn received_from(&self) -> ReceivedFrom {
        ReceivedFrom {
            helo: self.session.helo.clone(),
            address: self.session.peer.ip(),
        }
    }

    /// The mail as handed to a destination, restricted to `recipients`.
    #[must_use]
    pub fn mail_for(&self, recipients: Vec<Recipient>) -> Mail {
        let mut mail = Mail::new(
            self.from.clone(),
            recipients,
            self.data.clone().unwrap_or_default(),
        )
        .with_received_from(Some(self.received_from()));
        mail.arrival = self.arrival;
        mail.scheduled = self.arrival;
        mail
    }
}

/// One recipient under processing.
#[derive(Debug, Clone)]
pub struct RecipientContext {
    pub recipient: Recipient,
    destination: Option<Destination>,
    responsibility_transferred: bool,
}

impl RecipientContext {
    #[must_use]
    pub const fn new(recipient: Recipient) -> Self {
        Self {
            recipient,
            destination: None,
            responsibility_transferred: false,
        }
    }

    #[must_use]
    pub const fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn set_destination(&mut self, destination: Destination) {
        self.destination = Some(destination);
    }

    #[must_use]
    pub const fn is_destination_assigned(&self) -> bool {
        self.destination.is_some()
    }

    /// Whether some stage took final ownership of this recipient.
    #[must_use]
    pub const fn is_responsibility_transferred(&self) -> bool {
        self.responsibility_transferred
    }

    /// Once set, never reset.
    pub const fn transfer_responsibility(&mut self) {
        self.responsibility_transferred = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionInfo {
        let mut info = SessionInfo::new("192.0.2.7:4242".parse().unwrap(), "mx.example.com");
        info.helo = Some(String::from("client.example.org"));
        info
    }

    #[test]
    fn mail_copies_only_the_given_recipients() {
        let mut tx = MailTransaction::new(session());
        tx.from = "jane@example.com".parse().unwrap();
        tx.data = Some(MailData::from("Hello World!\r\n"));

        let john: Recipient = "john@example.com".parse().unwrap();
        let mail = tx.mail_for(vec![john.clone()]);

        assert_eq!(mail.recipients, vec![john]);
        assert_eq!(mail.arrival, tx.arrival);
        assert_eq!(&*mail.data, b"Hello World!\r\n");
        let received = mail.received_from.unwrap();
        assert_eq!(received.helo.as_deref(), Some("client.example.org"));
        assert_eq!(received.address.to_string(), "192.0.2.7");
    }

    #[test]
    fn responsibility_is_monotonic() {
        let mut ctx = RecipientContext::new("john@example.com".parse().unwrap());
        assert!(!ctx.is_responsibility_transferred());
        assert!(!ctx.is_destination_assigned());

        ctx.transfer_responsibility();
        ctx.set_destination(Destination::Null);
        assert!(ctx.is_responsibility_transferred());
        assert!(ctx.is_destination_assigned());
    }
}
