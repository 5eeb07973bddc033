//! Durable storage of queued mails.
//!
//! Each mail is a pair of files named after its [`MailName`]:
//! - `<name>.eml` holds the content as received;
//! - `<name>.properties` holds the envelope as RON.
//!
//! The envelope is written last and removed first, so a mail exists exactly
//! when its envelope does. Both files go through a `temp.` file and a rename.
//! Mails which can never be delivered are moved to the `error` subdirectory
//! for inspection.

use std::{
    collections::BTreeSet,
    net::IpAddr,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use mireka_common::{
    address::{Recipient, ReversePath},
    internal,
    mail::{Mail, MailData, ReceivedFrom},
    tracing,
};
use mireka_tracing::traced;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
    error::QueueError,
    name::{CONTENT_EXTENSION, ENVELOPE_EXTENSION, MailName},
};

const TEMP_PREFIX: &str = "temp.";
const ERROR_DIRECTORY: &str = "error";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    from: ReversePath,
    recipients: Vec<Recipient>,
    arrival: DateTime<Utc>,
    scheduled: DateTime<Utc>,
    delivery_attempts: u32,
    postpones: u32,
    received_from_helo: Option<String>,
    received_from_address: Option<IpAddr>,
}

impl Envelope {
    fn of(mail: &Mail) -> Self {
        Self {
            from: mail.from.clone(),
            recipients: mail.recipients.clone(),
            arrival: mail.arrival,
            scheduled: mail.scheduled,
            delivery_attempts: mail.delivery_attempts,
            postpones: mail.postpones,
            received_from_helo: mail.received_from.as_ref().and_then(|r| r.helo.clone()),
            received_from_address: mail.received_from.as_ref().map(|r| r.address),
        }
    }

    fn into_mail(self, data: MailData) -> Mail {
        Mail {
            from: self.from,
            recipients: self.recipients,
            data,
            arrival: self.arrival,
            scheduled: self.scheduled,
            delivery_attempts: self.delivery_attempts,
            postpones: self.postpones,
            received_from: self.received_from_address.map(|address| ReceivedFrom {
                helo: self.received_from_helo,
                address,
            }),
        }
    }
}

#[derive(Debug)]
pub struct QueueStore {
    directory: PathBuf,
    capacity: usize,
    names: Mutex<BTreeSet<MailName>>,
}

impl QueueStore {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            directory: directory.into(),
            capacity,
            names: Mutex::new(BTreeSet::new()),
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[must_use]
    pub fn error_directory(&self) -> PathBuf {
        self.directory.join(ERROR_DIRECTORY)
    }

    /// Number of mails in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }

    /// Creates the directories, removes leftovers of interrupted operations
    /// and loads the names of the queued mails.
    ///
    /// Returns the names in schedule order.
    pub async fn init(&self) -> Result<Vec<MailName>, QueueError> {
        internal!("Initialising queue store at {}", self.directory.display());

        let directory_error = |source| QueueError::Directory {
            path: self.directory.display().to_string(),
            source,
        };

        fs::create_dir_all(self.error_directory())
            .await
            .map_err(directory_error)?;

        let mut envelopes = BTreeSet::new();
        let mut contents = Vec::new();
        let mut entries = fs::read_dir(&self.directory).await.map_err(directory_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(directory_error)? {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();

            if file_name.starts_with(TEMP_PREFIX) {
                internal!(level = INFO, "Removing interrupted write {file_name}");
                remove(&entry.path()).await?;
            } else if file_name.ends_with(ENVELOPE_EXTENSION) {
                match MailName::from_file_name(&file_name) {
                    Ok(name) => {
                        envelopes.insert(name);
                    }
                    Err(err) => internal!(level = WARN, "Ignoring {file_name}: {err}"),
                }
            } else if file_name.ends_with(CONTENT_EXTENSION)
                && let Ok(name) = MailName::from_file_name(&file_name)
            {
                contents.push((name, entry.path()));
            }
        }

        // Content without an envelope is left over from an interrupted delete.
        for (name, path) in contents {
            if !envelopes.contains(&name) {
                internal!(level = INFO, "Removing orphaned content {name}");
                remove(&path).await?;
            }
        }

        let names: Vec<MailName> = envelopes.iter().copied().collect();
        *self.names.lock() = envelopes;

        internal!(level = INFO, "Queue {} holds {} mail(s)", self.directory.display(), names.len());
        Ok(names)
    }

    /// Reserves a unique name for a mail scheduled at `scheduled`.
    fn allocate(&self, scheduled: DateTime<Utc>) -> Result<MailName, QueueError> {
        let mut names = self.names.lock();
        if names.len() >= self.capacity {
            return Err(QueueError::Full(names.len()));
        }

        let first = MailName::new(scheduled, 0);
        let last = MailName::new(scheduled, u32::MAX);
        let sequence = names
            .range(first..=last)
            .next_back()
            .map_or(0, |previous| previous.sequence().saturating_add(1));

        let name = MailName::new(scheduled, sequence);
        names.insert(name);
        Ok(name)
    }

    fn release(&self, name: &MailName) {
        self.names.lock().remove(name);
    }

    fn path(&self, file_name: &str) -> PathBuf {
        self.directory.join(file_name)
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip_all), timing(precision = "ms"))]
    pub async fn save(&self, mail: &Mail) -> Result<MailName, QueueError> {
        let name = self.allocate(mail.scheduled)?;

        if let Err(err) = self.write(&name, mail).await {
            internal!(level = ERROR, "Failed to store mail {name}: {err}");
            for file_name in [
                name.envelope_file_name(),
                name.content_file_name(),
                format!("{TEMP_PREFIX}{}", name.envelope_file_name()),
                format!("{TEMP_PREFIX}{}", name.content_file_name()),
            ] {
                let _ = fs::remove_file(self.path(&file_name)).await;
            }
            self.release(&name);
            return Err(err);
        }

        internal!(level = DEBUG, "Stored mail {name} for {} recipient(s)", mail.recipients.len());
        Ok(name)
    }

    async fn write(&self, name: &MailName, mail: &Mail) -> Result<(), QueueError> {
        let envelope = ron::ser::to_string_pretty(&Envelope::of(mail), ron::ser::PrettyConfig::default())
            .map_err(|err| QueueError::Envelope {
                name: name.to_string(),
                reason: err.to_string(),
            })?;

        self.write_file(&name.content_file_name(), &mail.data).await?;
        self.write_file(&name.envelope_file_name(), envelope.as_bytes()).await
    }

    async fn write_file(&self, file_name: &str, content: &[u8]) -> Result<(), QueueError> {
        let write_error = |source| QueueError::Write {
            name: file_name.to_string(),
            source,
        };

        let temp = self.path(&format!("{TEMP_PREFIX}{file_name}"));
        fs::write(&temp, content).await.map_err(write_error)?;
        fs::rename(&temp, self.path(file_name))
            .await
            .map_err(write_error)
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(name = %name)), timing(precision = "ms"))]
    pub async fn read(&self, name: &MailName) -> Result<Mail, QueueError> {
        let read = |file_name: String| async move {
            fs::read(self.path(&file_name))
                .await
                .map_err(|source| QueueError::Read {
                    name: file_name,
                    source,
                })
        };

        let envelope = read(name.envelope_file_name()).await?;
        let envelope: Envelope = std::str::from_utf8(&envelope)
            .map_err(|err| err.to_string())
            .and_then(|text| ron::from_str(text).map_err(|err| err.to_string()))
            .map_err(|reason| QueueError::Envelope {
                name: name.to_string(),
                reason,
            })?;
        let data = read(name.content_file_name()).await?;

        Ok(envelope.into_mail(MailData::from(data)))
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(name = %name)), timing(precision = "ms"))]
    pub async fn delete(&self, name: &MailName) -> Result<(), QueueError> {
        remove(&self.path(&name.envelope_file_name())).await?;
        remove(&self.path(&name.content_file_name())).await?;
        self.release(name);

        internal!(level = DEBUG, "Removed mail {name} from the queue");
        Ok(())
    }

    /// Takes the mail out of the queue, keeping its files in the error
    /// directory.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(name = %name)), timing(precision = "ms"))]
    pub async fn move_to_error(&self, name: &MailName) -> Result<(), QueueError> {
        let errors = self.error_directory();
        let content = name.content_file_name();
        let envelope = name.envelope_file_name();

        // The content first: until the envelope moves the mail is still queued.
        rename(&self.path(&content), &errors.join(&content)).await?;
        rename(&self.path(&envelope), &errors.join(&envelope)).await?;
        self.release(name);

        internal!(level = WARN, "Moved mail {name} to {}", errors.display());
        Ok(())
    }
}

async fn remove(path: &Path) -> Result<(), QueueError> {
    match fs::remove_file(path).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(QueueError::Remove {
            name: path.display().to_string(),
            source: err,
        }),
        _ => Ok(()),
    }
}

async fn rename(from: &Path, to: &Path) -> Result<(), QueueError> {
    fs::rename(from, to).await.map_err(|source| QueueError::Write {
        name: to.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn mail(text: &str) -> Mail {
        Mail::new(
            "jane@example.com".parse().unwrap(),
            vec!["john@example.org".parse().unwrap(), "mary@example.org".parse().unwrap()],
            MailData::from(text),
        )
        .with_received_from(Some(ReceivedFrom {
            helo: Some(String::from("client.example.com")),
            address: "192.0.2.7".parse().unwrap(),
        }))
    }

    #[tokio::test]
    async fn saved_mail_is_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path(), 10);
        store.init().await.unwrap();

        let mut original = mail("Subject: hello\r\n\r\nHello World!\r\n");
        original.delivery_attempts = 2;
        original.postpones = 1;
        let name = store.save(&original).await.unwrap();

        let read = store.read(&name).await.unwrap();
        assert_eq!(read.from, original.from);
        assert_eq!(read.recipients, original.recipients);
        assert_eq!(&*read.data, &*original.data);
        assert_eq!(read.arrival, original.arrival);
        assert_eq!(read.scheduled, original.scheduled);
        assert_eq!(read.delivery_attempts, 2);
        assert_eq!(read.postpones, 1);
        assert_eq!(read.received_from, original.received_from);
    }

    #[tokio::test]
    async fn null_sender_survives_storage() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path(), 10);
        store.init().await.unwrap();

        let mut bounce = mail("Subject: bounce\r\n\r\n");
        bounce.from = ReversePath::Null;
        bounce.received_from = None;
        let name = store.save(&bounce).await.unwrap();

        let read = store.read(&name).await.unwrap();
        assert!(read.from.is_null());
        assert_eq!(read.received_from, None);
    }

    #[tokio::test]
    async fn same_millisecond_gets_a_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path(), 10);
        store.init().await.unwrap();

        let mail = mail("x\r\n");
        let first = store.save(&mail).await.unwrap();
        let second = store.save(&mail).await.unwrap();
        let third = store.save(&mail).await.unwrap();

        assert_eq!(first.sequence(), 0);
        assert_eq!(second.sequence(), 1);
        assert_eq!(third.sequence(), 2);
        assert!(first < second && second < third);
    }

    #[tokio::test]
    async fn restart_keeps_names_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut saved = Vec::new();
        {
            let store = QueueStore::new(dir.path(), 10);
            store.init().await.unwrap();
            for offset in [30, 10, 20] {
                let mut mail = mail("x\r\n");
                mail.scheduled += Duration::seconds(offset);
                saved.push(store.save(&mail).await.unwrap());
            }
            store.delete(&saved[2]).await.unwrap();
        }

        let store = QueueStore::new(dir.path(), 10);
        let names = store.init().await.unwrap();
        assert_eq!(names, vec![saved[1], saved[0]]);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn full_queue_refuses_without_damage() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path(), 2);
        store.init().await.unwrap();

        let first = store.save(&mail("1\r\n")).await.unwrap();
        store.save(&mail("2\r\n")).await.unwrap();
        let err = store.save(&mail("3\r\n")).await.unwrap_err();
        assert!(matches!(err, QueueError::Full(2)));
        assert_eq!(store.len(), 2);
        assert_eq!(&*store.read(&first).await.unwrap().data, b"1\r\n");

        store.delete(&first).await.unwrap();
        store.save(&mail("3\r\n")).await.unwrap();
        assert!(store.save(&mail("4\r\n")).await.is_err());
    }

    #[tokio::test]
    async fn error_directory_keeps_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path(), 10);
        store.init().await.unwrap();

        let name = store.save(&mail("broken\r\n")).await.unwrap();
        store.move_to_error(&name).await.unwrap();

        assert!(store.is_empty());
        assert!(store.error_directory().join(name.envelope_file_name()).exists());
        assert!(store.error_directory().join(name.content_file_name()).exists());
        assert!(!dir.path().join(name.envelope_file_name()).exists());
    }

    #[tokio::test]
    async fn leftovers_are_cleaned_on_init() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path(), 10);
        store.init().await.unwrap();
        let kept = store.save(&mail("kept\r\n")).await.unwrap();

        let orphan = MailName::new(Utc::now() + Duration::hours(1), 0);
        std::fs::write(dir.path().join(orphan.content_file_name()), b"orphan").unwrap();
        std::fs::write(dir.path().join("temp.whatever.properties"), b"half").unwrap();

        let store = QueueStore::new(dir.path(), 10);
        assert_eq!(store.init().await.unwrap(), vec![kept]);
        assert!(!dir.path().join(orphan.content_file_name()).exists());
        assert!(!dir.path().join("temp.whatever.properties").exists());
    }
}
