//! The mail envelope and its content as handed between components.

use std::{fmt, net::IpAddr, ops::Deref, sync::Arc};

use chrono::{DateTime, Utc};

use crate::address::{Recipient, ReversePath};

/// Raw message content, shared between every copy of a [`Mail`].
///
/// Cloning is cheap and never duplicates the bytes.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MailData(Arc<[u8]>);

impl MailData {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The header section, up to but excluding the empty line.
    #[must_use]
    pub fn header_section(&self) -> &[u8] {
        let end = self
            .0
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|p| p + 2)
            .or_else(|| self.0.windows(2).position(|w| w == b"\n\n").map(|p| p + 1))
            .unwrap_or(self.0.len());
        &self.0[..end]
    }

    /// Number of header fields named `name`, ignoring case.
    #[must_use]
    pub fn count_header(&self, name: &str) -> usize {
        self.header_section()
            .split(|&b| b == b'\n')
            .filter(|line| {
                line.len() > name.len()
                    && line[name.len()] == b':'
                    && line[..name.len()].eq_ignore_ascii_case(name.as_bytes())
            })
            .count()
    }

    /// A new content with `field` (without line ending) put before the
    /// existing header section.
    #[must_use]
    pub fn with_prepended_header(&self, field: &str) -> Self {
        let mut bytes = Vec::with_capacity(field.len() + 2 + self.0.len());
        bytes.extend_from_slice(field.as_bytes());
        bytes.extend_from_slice(b"\r\n");
        bytes.extend_from_slice(&self.0);
        Self::from(bytes)
    }
}

impl Deref for MailData {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<u8>> for MailData {
    fn from(value: Vec<u8>) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&[u8]> for MailData {
    fn from(value: &[u8]) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&str> for MailData {
    fn from(value: &str) -> Self {
        Self::from(value.as_bytes())
    }
}

impl fmt::Debug for MailData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MailData({} bytes)", self.0.len())
    }
}

/// The peer a mail was received from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedFrom {
    /// The name given in HELO/EHLO.
    pub helo: Option<String>,
    pub address: IpAddr,
}

/// Envelope plus content.
///
/// Cloning produces an independent envelope sharing the same content.
#[derive(Clone, Debug)]
pub struct Mail {
    pub from: ReversePath,
    pub recipients: Vec<Recipient>,
    pub data: MailData,
    pub arrival: DateTime<Utc>,
    /// When the next delivery attempt is due.
    pub scheduled: DateTime<Utc>,
    pub delivery_attempts: u32,
    /// Deferrals that did not count as attempts.
    pub postpones: u32,
    /// `None` for locally generated mail.
    pub received_from: Option<ReceivedFrom>,
}

impl Mail {
    #[must_use]
    pub fn new(from: ReversePath, recipients: Vec<Recipient>, data: MailData) -> Self {
        let now = Utc::now();
        Self {
            from,
            recipients,
            data,
            arrival: now,
            scheduled: now,
            delivery_attempts: 0,
            postpones: 0,
            received_from: None,
        }
    }

    #[must_use]
    pub fn with_received_from(mut self, received_from: Option<ReceivedFrom>) -> Self {
        self.received_from = received_from;
        self
    }

    /// A copy of the envelope restricted to `recipients`.
    #[must_use]
    pub fn for_recipients(&self, recipients: Vec<Recipient>) -> Self {
        Self {
            recipients,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_share_content() {
        let mail = Mail::new(
            "jane@example.com".parse().unwrap(),
            vec!["john@example.com".parse().unwrap()],
            MailData::from("Subject: hi\r\n\r\nHello World!\r\n"),
        );

        let mut copy = mail.for_recipients(Vec::new());
        copy.delivery_attempts = 3;

        assert_eq!(mail.recipients.len(), 1);
        assert_eq!(mail.delivery_attempts, 0);
        assert!(std::ptr::eq(mail.data.as_ptr(), copy.data.as_ptr()));
    }

    #[test]
    fn header_inspection() {
        let data = MailData::from(
            "Received: from a\r\nreceived: from b\r\nSubject: x\r\n\r\nReceived: body\r\n",
        );
        assert_eq!(data.count_header("Received"), 2);
        assert_eq!(data.header_section(), b"Received: from a\r\nreceived: from b\r\nSubject: x\r\n");

        let prefixed = data.with_prepended_header("Received: from c");
        assert_eq!(prefixed.count_header("received"), 3);
        assert!(prefixed.starts_with(b"Received: from c\r\n"));
    }
}
