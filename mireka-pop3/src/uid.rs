//! The per-maildrop counter handing out message uids.
//!
//! The highest allocated uid is kept in `uid.txt` as the decimal number
//! followed by `+`, so a truncated write is recognised. A new value goes to
//! `temp.uid.txt` first and is renamed over the counter file.

use std::path::{Path, PathBuf};

use mireka_common::internal;
use tokio::fs;

use crate::error::MaildropError;

const UID_FILE: &str = "uid.txt";
const TEMP_UID_FILE: &str = "temp.uid.txt";

#[derive(Debug)]
pub struct UidCounter {
    file: PathBuf,
    temp_file: PathBuf,
    highest: u64,
}

impl UidCounter {
    /// Starts a new counter in `directory`, replacing any previous one.
    pub async fn create(directory: &Path) -> Result<Self, MaildropError> {
        let counter = Self {
            file: directory.join(UID_FILE),
            temp_file: directory.join(TEMP_UID_FILE),
            highest: 0,
        };
        write(&counter.file, 0).await?;
        Ok(counter)
    }

    /// Reads the counter of `directory`, recovering from an interrupted
    /// update.
    pub async fn open(directory: &Path) -> Result<Self, MaildropError> {
        let file = directory.join(UID_FILE);
        let temp_file = directory.join(TEMP_UID_FILE);

        let highest = match read(&file).await {
            Ok(highest) => highest,
            Err(err) => {
                internal!(level = WARN, "Cannot read uid file, trying to recover: {err}");
                if !fs::try_exists(&temp_file).await.unwrap_or(false) {
                    return Err(err);
                }
                fs::rename(&temp_file, &file)
                    .await
                    .map_err(MaildropError::io("Renaming", &temp_file))?;
                read(&file).await?
            }
        };

        match fs::remove_file(&temp_file).await {
            Ok(()) => internal!(level = WARN, "Removed stale {}", temp_file.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(MaildropError::io("Removing", &temp_file)(err)),
        }

        Ok(Self {
            file,
            temp_file,
            highest,
        })
    }

    #[must_use]
    pub const fn highest(&self) -> u64 {
        self.highest
    }

    pub async fn allocate(&mut self) -> Result<u64, MaildropError> {
        let uid = self.highest + 1;
        write(&self.temp_file, uid).await?;
        fs::rename(&self.temp_file, &self.file)
            .await
            .map_err(MaildropError::io("Renaming", &self.temp_file))?;
        self.highest = uid;
        Ok(uid)
    }
}

async fn write(path: &Path, uid: u64) -> Result<(), MaildropError> {
    fs::write(path, format!("{uid}+"))
        .await
        .map_err(MaildropError::io("Writing", path))
}

async fn read(path: &Path) -> Result<u64, MaildropError> {
    let content = fs::read_to_string(path)
        .await
        .map_err(MaildropError::io("Reading", path))?;
    content
        .strip_suffix('+')
        .filter(|digits| !digits.is_empty())
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| MaildropError::Corrupt(format!("invalid uid file {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocation_is_persistent() {
        let dir = tempfile::tempdir().unwrap();
        let mut counter = UidCounter::create(dir.path()).await.unwrap();
        assert_eq!(counter.allocate().await.unwrap(), 1);
        assert_eq!(counter.allocate().await.unwrap(), 2);

        let mut reopened = UidCounter::open(dir.path()).await.unwrap();
        assert_eq!(reopened.highest(), 2);
        assert_eq!(reopened.allocate().await.unwrap(), 3);
        assert_eq!(std::fs::read_to_string(dir.path().join(UID_FILE)).unwrap(), "3+");
    }

    #[tokio::test]
    async fn truncated_file_is_recovered_from_the_temporary_one() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(UID_FILE), "1").unwrap();
        std::fs::write(dir.path().join(TEMP_UID_FILE), "12+").unwrap();

        let counter = UidCounter::open(dir.path()).await.unwrap();
        assert_eq!(counter.highest(), 12);
        assert!(!dir.path().join(TEMP_UID_FILE).exists());
    }

    #[tokio::test]
    async fn garbage_without_backup_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(UID_FILE), "twelve+").unwrap();

        assert!(matches!(
            UidCounter::open(dir.path()).await,
            Err(MaildropError::Corrupt(_))
        ));
    }
}
