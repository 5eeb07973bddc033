//! Names of queued mails.
//!
//! A name is derived from the time the mail is scheduled for, so sorting the
//! files of a queue directory by name sorts them by schedule. Mails scheduled
//! for the same millisecond are told apart by a sequence number.

use std::{
    cmp::Ordering,
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use chrono::{DateTime, SubsecRound, Utc};
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f%z";
const DATE_LENGTH: usize = 28;

pub const ENVELOPE_EXTENSION: &str = ".properties";
pub const CONTENT_EXTENSION: &str = ".eml";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MailNameError {
    #[error("'{0}' is too short to be a mail name")]
    TooShort(String),

    #[error("Invalid schedule date in '{0}'")]
    Date(String),

    #[error("Invalid sequence number in '{0}'")]
    Sequence(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MailName {
    scheduled: DateTime<Utc>,
    sequence: u32,
}

impl MailName {
    /// The schedule is truncated to the millisecond precision of the file
    /// name.
    #[must_use]
    pub fn new(scheduled: DateTime<Utc>, sequence: u32) -> Self {
        Self {
            scheduled: scheduled.trunc_subsecs(3),
            sequence,
        }
    }

    #[must_use]
    pub const fn scheduled(&self) -> DateTime<Utc> {
        self.scheduled
    }

    #[must_use]
    pub const fn sequence(&self) -> u32 {
        self.sequence
    }

    #[must_use]
    pub fn envelope_file_name(&self) -> String {
        format!("{self}{ENVELOPE_EXTENSION}")
    }

    #[must_use]
    pub fn content_file_name(&self) -> String {
        format!("{self}{CONTENT_EXTENSION}")
    }

    /// Recovers the name from a file name of the queue directory, ignoring
    /// anything after the base name.
    pub fn from_file_name(file_name: &str) -> Result<Self, MailNameError> {
        let base = file_name
            .strip_suffix(ENVELOPE_EXTENSION)
            .or_else(|| file_name.strip_suffix(CONTENT_EXTENSION))
            .unwrap_or(file_name);
        base.parse()
    }
}

impl Ord for MailName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.scheduled
            .cmp(&other.scheduled)
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for MailName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for MailName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.scheduled.format(DATE_FORMAT))?;
        if self.sequence != 0 {
            write!(f, "_{}", self.sequence)?;
        }
        Ok(())
    }
}

impl FromStr for MailName {
    type Err = MailNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (date, rest) = s
            .split_at_checked(DATE_LENGTH)
            .ok_or_else(|| MailNameError::TooShort(s.to_string()))?;

        let scheduled = DateTime::parse_from_str(date, DATE_FORMAT)
            .map_err(|_| MailNameError::Date(s.to_string()))?
            .with_timezone(&Utc);

        let sequence = match rest.strip_prefix('_') {
            None => 0,
            Some(digits) => {
                let end = digits
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(digits.len());
                digits[..end]
                    .parse()
                    .map_err(|_| MailNameError::Sequence(s.to_string()))?
            }
        };

        Ok(Self::new(scheduled, sequence))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap() + Duration::milliseconds(535)
    }

    #[test]
    fn file_names() {
        let name = MailName::new(date(), 0);
        assert_eq!(name.to_string(), "2026-03-14T15-09-26.535+0000");
        assert_eq!(name.to_string().len(), DATE_LENGTH);
        assert_eq!(name.envelope_file_name(), "2026-03-14T15-09-26.535+0000.properties");

        let name = MailName::new(date(), 12);
        assert_eq!(name.content_file_name(), "2026-03-14T15-09-26.535+0000_12.eml");
    }

    #[test]
    fn parses_its_own_output() {
        for sequence in [0, 1, 4711] {
            let name = MailName::new(date(), sequence);
            let parsed: MailName = name.to_string().parse().unwrap();
            assert_eq!(parsed.scheduled(), name.scheduled());
            assert_eq!(parsed.sequence(), sequence);
        }

        let parsed = MailName::from_file_name("2026-03-14T15-09-26.535+0000_3.properties").unwrap();
        assert_eq!(parsed, MailName::new(date(), 3));
    }

    #[test]
    fn other_offsets_are_normalised() {
        let parsed: MailName = "2026-03-14T16-09-26.535+0100".parse().unwrap();
        assert_eq!(parsed.scheduled(), date());
    }

    #[test]
    fn orders_by_schedule_then_sequence() {
        let early = MailName::new(date(), 7);
        let late = MailName::new(date() + Duration::milliseconds(1), 0);
        assert!(early < late);
        assert!(MailName::new(date(), 1) < MailName::new(date(), 2));
        assert!(MailName::new(date(), 9) < MailName::new(date(), 10));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!("short".parse::<MailName>(), Err(MailNameError::TooShort(_))));
        assert!(matches!(
            "2026-13-14T15-09-26.535+0000".parse::<MailName>(),
            Err(MailNameError::Date(_))
        ));
        assert!(matches!(
            "2026-03-14T15-09-26.535+0000_x".parse::<MailName>(),
            Err(MailNameError::Sequence(_))
        ));
    }
}
