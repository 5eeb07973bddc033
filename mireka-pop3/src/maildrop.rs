//! A user's maildrop: one directory holding a file per message.
//!
//! Messages are stored as `<uid>.eml`, written through a
//! `temp.mail.<uid>.eml` file and a rename. A `constructed` marker is
//! created once the directory and its uid counter are complete.
//!
//! At most one POP3 transaction holds a maildrop. Mail delivered while a
//! transaction is running becomes visible once the transaction ends, so
//! message numbers stay stable for the client.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use mireka_common::{internal, tracing};
use mireka_tracing::traced;
use parking_lot::Mutex;
use tokio::fs;

use crate::{
    error::{MaildropError, Pop3Error},
    uid::UidCounter,
};

const CONSTRUCTED_MARKER: &str = "constructed";
const TEMP_MAIL_PREFIX: &str = "temp.mail.";
const MAIL_EXTENSION: &str = ".eml";

#[derive(Debug, Clone, Copy)]
struct Message {
    uid: u64,
    length: u64,
    deleted: bool,
}

#[derive(Debug, Default)]
struct State {
    /// Ordered by uid; `None` until the directory was read.
    messages: Option<Vec<Message>>,
    /// Delivered during the running transaction.
    pending: Vec<Message>,
    in_transaction: bool,
}

impl State {
    fn append_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.messages.get_or_insert_with(Vec::new).extend(pending);
    }
}

#[derive(Debug)]
pub struct Maildrop {
    name: String,
    directory: PathBuf,
    state: Mutex<State>,
    /// Serialises initialisation and uid allocation.
    uids: tokio::sync::Mutex<Option<UidCounter>>,
}

impl Maildrop {
    #[must_use]
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            state: Mutex::new(State::default()),
            uids: tokio::sync::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn mail_path(&self, uid: u64) -> PathBuf {
        self.directory.join(format!("{uid}{MAIL_EXTENSION}"))
    }

    /// Reads the maildrop from disk on first use, constructing it when it
    /// does not exist yet.
    async fn initialise(&self, uids: &mut Option<UidCounter>) -> Result<(), MaildropError> {
        if uids.is_some() {
            return Ok(());
        }

        let marker = self.directory.join(CONSTRUCTED_MARKER);
        let counter = if fs::try_exists(&marker).await.unwrap_or(false) {
            UidCounter::open(&self.directory).await?
        } else {
            internal!(level = INFO, "Constructing maildrop {} at {}", self.name, self.directory.display());
            fs::create_dir_all(&self.directory)
                .await
                .map_err(MaildropError::io("Creating", &self.directory))?;
            let counter = UidCounter::create(&self.directory).await?;
            fs::write(&marker, b"")
                .await
                .map_err(MaildropError::io("Writing", &marker))?;
            counter
        };

        let messages = self.read_directory().await?;
        self.state.lock().messages = Some(messages);
        *uids = Some(counter);
        Ok(())
    }

    async fn read_directory(&self) -> Result<Vec<Message>, MaildropError> {
        let listing_error = MaildropError::io("Listing", &self.directory);
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(err) => return Err(listing_error(err)),
        };

        let mut messages = Vec::new();
        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => return Err(MaildropError::io("Listing", &self.directory)(err)),
            };
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();

            if file_name.starts_with(TEMP_MAIL_PREFIX) {
                fs::remove_file(entry.path())
                    .await
                    .map_err(MaildropError::io("Removing", &entry.path()))?;
                removed += 1;
                continue;
            }
            if !file_name.starts_with(|c: char| c.is_ascii_digit()) {
                continue;
            }

            let uid = file_name
                .strip_suffix(MAIL_EXTENSION)
                .and_then(|base| base.parse().ok())
                .ok_or_else(|| MaildropError::Corrupt(format!("invalid mail file name {file_name}")))?;
            let length = entry
                .metadata()
                .await
                .map_err(MaildropError::io("Inspecting", &entry.path()))?
                .len();
            messages.push(Message {
                uid,
                length,
                deleted: false,
            });
        }

        if removed > 0 {
            internal!(level = WARN, "Removed {removed} temporary mail file(s) in {}", self.directory.display());
        }
        messages.sort_by_key(|message| message.uid);
        Ok(messages)
    }

    /// Stores a new message and returns its uid.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self, content), fields(maildrop = %self.name)), timing(precision = "ms"))]
    pub async fn append(&self, content: &[&[u8]]) -> Result<u64, MaildropError> {
        let mut uids = self.uids.lock().await;
        self.initialise(&mut uids).await?;
        let Some(counter) = uids.as_mut() else {
            return Err(MaildropError::Corrupt(String::from("uid counter is missing")));
        };
        let uid = counter.allocate().await?;
        drop(uids);

        let temp = self.directory.join(format!("{TEMP_MAIL_PREFIX}{uid}{MAIL_EXTENSION}"));
        let target = self.mail_path(uid);
        let written = async {
            fs::write(&temp, content.concat())
                .await
                .map_err(MaildropError::io("Writing", &temp))?;
            fs::rename(&temp, &target)
                .await
                .map_err(MaildropError::io("Renaming", &temp))
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }

        let message = Message {
            uid,
            length: content.iter().map(|part| part.len() as u64).sum(),
            deleted: false,
        };
        let mut state = self.state.lock();
        state.pending.push(message);
        if !state.in_transaction {
            state.append_pending();
        }
        drop(state);

        internal!(level = DEBUG, "Message {uid} added to maildrop {}", self.name);
        Ok(uid)
    }

    /// Locks the maildrop for a POP3 transaction.
    ///
    /// # Errors
    /// [`Pop3Error::Locked`] while another transaction holds the maildrop.
    pub async fn begin(self: &Arc<Self>) -> Result<MaildropTransaction, Pop3Error> {
        let mut uids = self.uids.lock().await;
        self.initialise(&mut uids).await.inspect_err(|err| {
            internal!(level = ERROR, "Cannot read maildrop {}: {err}", self.name);
        })?;
        drop(uids);

        let mut state = self.state.lock();
        if state.in_transaction {
            return Err(Pop3Error::Locked);
        }
        state.in_transaction = true;
        drop(state);

        internal!(level = DEBUG, "Maildrop {} locked", self.name);
        Ok(MaildropTransaction {
            maildrop: Arc::clone(self),
            open: true,
        })
    }
}

/// `n octets` of a message, by message number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanListing {
    pub number: usize,
    pub octets: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidListing {
    pub number: usize,
    pub uid: u64,
}

/// Exclusive access to a maildrop. Dropping it without
/// [`commit`](Self::commit) undoes the deletions.
#[derive(Debug)]
pub struct MaildropTransaction {
    maildrop: Arc<Maildrop>,
    open: bool,
}

impl MaildropTransaction {
    fn with_messages<T>(&self, f: impl FnOnce(&mut Vec<Message>) -> T) -> T {
        let mut state = self.maildrop.state.lock();
        f(state.messages.get_or_insert_with(Vec::new))
    }

    fn message(&self, number: usize) -> Result<Message, Pop3Error> {
        self.with_messages(|messages| {
            let message = number
                .checked_sub(1)
                .and_then(|index| messages.get(index))
                .ok_or(Pop3Error::NoSuchMessage)?;
            if message.deleted {
                return Err(Pop3Error::DeletedMessage);
            }
            Ok(*message)
        })
    }

    /// Count and total size of the messages not marked as deleted.
    #[must_use]
    pub fn stat(&self) -> (usize, u64) {
        self.with_messages(|messages| {
            messages
                .iter()
                .filter(|message| !message.deleted)
                .fold((0, 0), |(count, octets), message| (count + 1, octets + message.length))
        })
    }

    #[must_use]
    pub fn scan_listings(&self) -> Vec<ScanListing> {
        self.with_messages(|messages| {
            messages
                .iter()
                .enumerate()
                .filter(|(_, message)| !message.deleted)
                .map(|(index, message)| ScanListing {
                    number: index + 1,
                    octets: message.length,
                })
                .collect()
        })
    }

    pub fn scan_listing(&self, number: usize) -> Result<ScanListing, Pop3Error> {
        let message = self.message(number)?;
        Ok(ScanListing {
            number,
            octets: message.length,
        })
    }

    #[must_use]
    pub fn uid_listings(&self) -> Vec<UidListing> {
        self.with_messages(|messages| {
            messages
                .iter()
                .enumerate()
                .filter(|(_, message)| !message.deleted)
                .map(|(index, message)| UidListing {
                    number: index + 1,
                    uid: message.uid,
                })
                .collect()
        })
    }

    pub fn uid_listing(&self, number: usize) -> Result<UidListing, Pop3Error> {
        let message = self.message(number)?;
        Ok(UidListing {
            number,
            uid: message.uid,
        })
    }

    pub async fn read(&self, number: usize) -> Result<Vec<u8>, Pop3Error> {
        let message = self.message(number)?;
        let path = self.maildrop.mail_path(message.uid);
        fs::read(&path).await.map_err(|err| {
            internal!(level = ERROR, "Cannot read mail file {}: {err}", path.display());
            Pop3Error::from(MaildropError::io("Reading", &path)(err))
        })
    }

    pub fn delete(&self, number: usize) -> Result<(), Pop3Error> {
        self.message(number)?;
        self.with_messages(|messages| {
            if let Some(message) = messages.get_mut(number - 1) {
                message.deleted = true;
            }
        });
        Ok(())
    }

    pub fn reset(&self) {
        self.with_messages(|messages| {
            for message in messages {
                message.deleted = false;
            }
        });
    }

    /// Removes the messages marked as deleted and releases the maildrop.
    ///
    /// # Errors
    /// When some files could not be removed. Those messages are kept and the
    /// maildrop is released anyway.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(maildrop = %self.maildrop.name)), timing(precision = "ms"))]
    pub async fn commit(mut self) -> Result<(), Pop3Error> {
        let deleted: Vec<u64> = self.with_messages(|messages| {
            messages
                .iter()
                .filter(|message| message.deleted)
                .map(|message| message.uid)
                .collect()
        });

        let mut failed = Vec::new();
        for uid in deleted {
            let path = self.maildrop.mail_path(uid);
            if let Err(err) = fs::remove_file(&path).await
                && err.kind() != std::io::ErrorKind::NotFound
            {
                internal!(level = ERROR, "Mail cannot be deleted {}: {err}", path.display());
                failed.push(uid);
            }
        }

        self.with_messages(|messages| {
            messages.retain_mut(|message| {
                if failed.contains(&message.uid) {
                    message.deleted = false;
                }
                !message.deleted
            });
        });
        self.release();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Pop3Error::Deletion(failed.len()))
        }
    }

    fn release(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        let mut state = self.maildrop.state.lock();
        for message in state.messages.iter_mut().flatten() {
            message.deleted = false;
        }
        state.append_pending();
        state.in_transaction = false;
        drop(state);

        internal!(level = DEBUG, "Maildrop {} released", self.maildrop.name);
    }
}

impl Drop for MaildropTransaction {
    fn drop(&mut self) {
        self.release();
    }
}

/// Maildrops by name, each under its own directory of a common root.
#[derive(Debug)]
pub struct MaildropRepository {
    root: PathBuf,
    maildrops: DashMap<String, Arc<Maildrop>>,
}

impl MaildropRepository {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            maildrops: DashMap::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The maildrop called `name`. Every caller shares the same instance.
    #[must_use]
    pub fn get(&self, name: &str) -> Arc<Maildrop> {
        let maildrop = self
            .maildrops
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Maildrop::new(name, self.root.join(name))));
        Arc::clone(&maildrop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn maildrop() -> (tempfile::TempDir, Arc<Maildrop>) {
        let root = tempfile::tempdir().unwrap();
        let repository = MaildropRepository::new(root.path());
        let maildrop = repository.get("john");
        (root, maildrop)
    }

    #[tokio::test]
    async fn append_and_list() {
        let (root, maildrop) = maildrop().await;
        assert_eq!(maildrop.append(&[b"first\r\n"]).await.unwrap(), 1);
        assert_eq!(maildrop.append(&[b"Return-Path: <>\r\n", b"second\r\n"]).await.unwrap(), 2);

        let directory = root.path().join("john");
        assert!(directory.join("1.eml").exists());
        assert!(directory.join(CONSTRUCTED_MARKER).exists());

        let transaction = maildrop.begin().await.unwrap();
        assert_eq!(transaction.stat(), (2, 32));
        assert_eq!(
            transaction.uid_listings(),
            vec![UidListing { number: 1, uid: 1 }, UidListing { number: 2, uid: 2 }]
        );
        assert_eq!(transaction.read(2).await.unwrap(), b"Return-Path: <>\r\nsecond\r\n");
    }

    #[tokio::test]
    async fn only_one_transaction_at_a_time() {
        let (_root, maildrop) = maildrop().await;
        let transaction = maildrop.begin().await.unwrap();
        assert!(matches!(maildrop.begin().await, Err(Pop3Error::Locked)));
        drop(transaction);
        assert!(maildrop.begin().await.is_ok());
    }

    #[tokio::test]
    async fn deletions_apply_on_commit_only() {
        let (root, maildrop) = maildrop().await;
        maildrop.append(&[b"one\r\n"]).await.unwrap();
        maildrop.append(&[b"two\r\n"]).await.unwrap();

        let transaction = maildrop.begin().await.unwrap();
        transaction.delete(1).unwrap();
        assert!(matches!(transaction.delete(1), Err(Pop3Error::DeletedMessage)));
        assert!(matches!(transaction.read(3).await, Err(Pop3Error::NoSuchMessage)));
        assert_eq!(transaction.stat(), (1, 5));
        drop(transaction);

        let transaction = maildrop.begin().await.unwrap();
        assert_eq!(transaction.stat().0, 2);
        transaction.delete(1).unwrap();
        transaction.commit().await.unwrap();
        assert!(!root.path().join("john/1.eml").exists());

        let transaction = maildrop.begin().await.unwrap();
        assert_eq!(transaction.scan_listings(), vec![ScanListing { number: 1, octets: 5 }]);
        assert_eq!(transaction.uid_listing(1).unwrap().uid, 2);
    }

    #[tokio::test]
    async fn delivery_during_a_transaction_waits_for_its_end() {
        let (_root, maildrop) = maildrop().await;
        maildrop.append(&[b"one\r\n"]).await.unwrap();

        let transaction = maildrop.begin().await.unwrap();
        maildrop.append(&[b"two\r\n"]).await.unwrap();
        assert_eq!(transaction.stat().0, 1);
        transaction.commit().await.unwrap();

        let transaction = maildrop.begin().await.unwrap();
        assert_eq!(transaction.stat().0, 2);
    }

    #[tokio::test]
    async fn reopened_maildrop_finds_its_messages() {
        let root = tempfile::tempdir().unwrap();
        Maildrop::new("jane", root.path().join("jane"))
            .append(&[b"kept\r\n"])
            .await
            .unwrap();
        std::fs::write(root.path().join("jane/temp.mail.9.eml"), b"partial").unwrap();

        let maildrop = Arc::new(Maildrop::new("jane", root.path().join("jane")));
        let transaction = maildrop.begin().await.unwrap();
        assert_eq!(transaction.stat(), (1, 6));
        assert!(!root.path().join("jane/temp.mail.9.eml").exists());
        drop(transaction);
        assert_eq!(maildrop.append(&[b"next\r\n"]).await.unwrap(), 2);
    }
}
