use std::sync::Arc;

use async_trait::async_trait;
use mireka_common::{error::LocalMailSystemError, internal, mail::Mail, status::EnhancedStatus};
use mireka_filter::{FilterError, MailDestination};

use crate::maildrop::Maildrop;

/// Stores accepted mail in a maildrop for POP3 retrieval, with a
/// `Return-Path` field recording the reverse path.
#[derive(Debug)]
pub struct MaildropDestination {
    maildrop: Arc<Maildrop>,
}

impl MaildropDestination {
    #[must_use]
    pub const fn new(maildrop: Arc<Maildrop>) -> Self {
        Self { maildrop }
    }
}

#[async_trait]
impl MailDestination for MaildropDestination {
    async fn data(&self, mail: Mail) -> Result<(), FilterError> {
        let return_path = format!("Return-Path: <{}>\r\n", mail.from);

        match self.maildrop.append(&[return_path.as_bytes(), &mail.data]).await {
            Ok(uid) => {
                internal!(
                    level = INFO,
                    "Mail from <{}> stored in maildrop {} as {uid}",
                    mail.from,
                    self.maildrop.name()
                );
                Ok(())
            }
            Err(err) => Err(LocalMailSystemError::new(
                EnhancedStatus::TRANSIENT_LOCAL_ERROR,
                format!("Cannot store mail in maildrop {}: {err}", self.maildrop.name()),
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use mireka_common::{address::ReversePath, mail::MailData};

    use super::*;
    use crate::maildrop::MaildropRepository;

    #[tokio::test]
    async fn return_path_is_prepended() {
        let root = tempfile::tempdir().unwrap();
        let repository = MaildropRepository::new(root.path());
        let destination = MaildropDestination::new(repository.get("john"));

        let from: ReversePath = "jane@example.com".parse().unwrap();
        let mail = Mail::new(from, Vec::new(), MailData::from("Subject: hi\r\n\r\nHello World!\r\n"));
        destination.data(mail).await.unwrap();

        let transaction = repository.get("john").begin().await.unwrap();
        assert_eq!(
            transaction.read(1).await.unwrap(),
            b"Return-Path: <jane@example.com>\r\nSubject: hi\r\n\r\nHello World!\r\n"
        );
    }

    #[tokio::test]
    async fn store_failure_is_transient() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("john");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let destination = MaildropDestination::new(Arc::new(Maildrop::new("john", &blocker)));
        let mail = Mail::new(ReversePath::Null, Vec::new(), MailData::from("x\r\n"));
        let err = destination.data(mail).await.unwrap_err();
        assert!(err.is_temporary());
    }
}
