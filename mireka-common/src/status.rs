use std::{
    borrow::Cow,
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

/// SMTP reply codes used by this server, see RFC 5321 section 4.2.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug, Hash)]
pub enum Status {
    SystemStatus,
    HelpMessage,
    ServiceReady,
    GoodBye,
    Ok,
    StartMailInput,
    Unavailable,
    MailboxUnavailable,
    ActionUnavailable,
    InsufficientStorage,
    SyntaxError,
    ParameterSyntaxError,
    NotImplemented,
    InvalidCommandSequence,
    Error,
    ExceededStorage,
    MailboxNameNotAllowed,
    TransactionFailed,
    Unknown(u16),
}

impl Status {
    #[must_use]
    pub fn is_success(self) -> bool {
        (200..400).contains(&u16::from(self))
    }

    /// Checks if the status is a permanent rejection
    #[must_use]
    pub fn is_permanent(self) -> bool {
        u16::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection
    #[must_use]
    pub fn is_temporary(self) -> bool {
        (400..500).contains(&u16::from(self))
    }
}

impl From<u16> for Status {
    fn from(value: u16) -> Self {
        match value {
            211 => Self::SystemStatus,
            214 => Self::HelpMessage,
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            250 => Self::Ok,
            354 => Self::StartMailInput,
            421 => Self::Unavailable,
            450 => Self::MailboxUnavailable,
            451 => Self::ActionUnavailable,
            452 => Self::InsufficientStorage,
            500 => Self::SyntaxError,
            501 => Self::ParameterSyntaxError,
            502 => Self::NotImplemented,
            503 => Self::InvalidCommandSequence,
            550 => Self::Error,
            552 => Self::ExceededStorage,
            553 => Self::MailboxNameNotAllowed,
            554 => Self::TransactionFailed,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Status> for u16 {
    fn from(value: Status) -> Self {
        match value {
            Status::SystemStatus => 211,
            Status::HelpMessage => 214,
            Status::ServiceReady => 220,
            Status::GoodBye => 221,
            Status::Ok => 250,
            Status::StartMailInput => 354,
            Status::Unavailable => 421,
            Status::MailboxUnavailable => 450,
            Status::ActionUnavailable => 451,
            Status::InsufficientStorage => 452,
            Status::SyntaxError => 500,
            Status::ParameterSyntaxError => 501,
            Status::NotImplemented => 502,
            Status::InvalidCommandSequence => 503,
            Status::Error => 550,
            Status::ExceededStorage => 552,
            Status::MailboxNameNotAllowed => 553,
            Status::TransactionFailed => 554,
            Status::Unknown(v) => v,
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", u16::from(*self))
    }
}

/// An RFC 3463 enhanced status code, `class.subject.detail`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EnhancedCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl EnhancedCode {
    #[must_use]
    pub const fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self {
            class,
            subject,
            detail,
        }
    }

    /// `x.0.0` derived from the class of a basic reply code.
    #[must_use]
    pub const fn approximate(reply_code: u16) -> Self {
        let class = match reply_code / 100 {
            2 | 3 => 2,
            4 => 4,
            _ => 5,
        };
        Self::new(class, 0, 0)
    }
}

impl Display for EnhancedCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

impl FromStr for EnhancedCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        let mut next = || {
            parts
                .next()
                .filter(|p| !p.is_empty() && p.len() <= 3 && p.bytes().all(|b| b.is_ascii_digit()))
                .ok_or_else(|| format!("invalid enhanced status code '{s}'"))
        };

        let class = next()?;
        let subject = next()?;
        let detail = next()?;

        let class: u8 = class
            .parse()
            .map_err(|_| format!("invalid enhanced status class '{class}'"))?;
        if !matches!(class, 2 | 4 | 5) {
            return Err(format!("invalid enhanced status class '{class}'"));
        }

        Ok(Self {
            class,
            subject: subject.parse().map_err(|_| format!("invalid subject '{subject}'"))?,
            detail: detail.parse().map_err(|_| format!("invalid detail '{detail}'"))?,
        })
    }
}

impl Serialize for EnhancedCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EnhancedCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

/// A reply code paired with an enhanced status code and a human readable text.
///
/// This is what local components report when they fail, and what is carried
/// into delivery status notifications.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct EnhancedStatus {
    pub reply_code: u16,
    pub code: EnhancedCode,
    pub message: Cow<'static, str>,
}

impl EnhancedStatus {
    pub const TRANSIENT_SYSTEM_NOT_ACCEPTING: Self =
        Self::constant(421, 4, 3, 2, "System not accepting network messages");
    pub const DIRECTORY_SERVER_FAILURE: Self =
        Self::constant(450, 4, 4, 3, "Directory server failure");
    pub const BAD_DESTINATION_SYSTEM_ADDRESS: Self =
        Self::constant(550, 5, 1, 2, "Bad destination system address");
    pub const PERMANENT_UNABLE_TO_ROUTE: Self =
        Self::constant(550, 5, 4, 4, "Unable to route");
    pub const TRANSIENT_LOCAL_ERROR: Self =
        Self::constant(451, 4, 3, 0, "Local error in processing");
    pub const MAIL_SYSTEM_FULL: Self = Self::constant(452, 4, 3, 1, "Mail system full");
    pub const BAD_DESTINATION_MAILBOX_SYNTAX: Self =
        Self::constant(553, 5, 1, 3, "Syntax error in mailbox name");
    pub const PERMANENT_INTERNAL_ERROR: Self =
        Self::constant(554, 5, 3, 0, "Internal error");

    const fn constant(
        reply_code: u16,
        class: u8,
        subject: u16,
        detail: u16,
        message: &'static str,
    ) -> Self {
        Self {
            reply_code,
            code: EnhancedCode::new(class, subject, detail),
            message: Cow::Borrowed(message),
        }
    }

    #[must_use]
    pub fn new(reply_code: u16, code: EnhancedCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            reply_code,
            code,
            message: message.into(),
        }
    }

    /// Builds a status from a reply that carried no enhanced code.
    #[must_use]
    pub fn from_reply(reply_code: u16, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(reply_code, EnhancedCode::approximate(reply_code), message)
    }

    /// Same status with a different text.
    #[must_use]
    pub fn with_message(&self, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            reply_code: self.reply_code,
            code: self.code,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.reply_code / 100 == 4
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.reply_code / 100 == 5
    }

    #[must_use]
    pub fn reply(&self) -> Reply {
        Reply {
            status: Status::from(self.reply_code),
            code: Some(self.code),
            message: self.message.clone(),
        }
    }
}

impl Display for EnhancedStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.reply_code, self.code, self.message)
    }
}

/// A complete SMTP reply as sent to a client.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Reply {
    pub status: Status,
    pub code: Option<EnhancedCode>,
    pub message: Cow<'static, str>,
}

impl Reply {
    #[must_use]
    pub fn new(status: Status, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn enhanced(
        status: Status,
        code: EnhancedCode,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            status,
            code: Some(code),
            message: message.into(),
        }
    }

    /// Each line of the reply, without the trailing CRLF. Multi-line messages
    /// use the `code-text` continuation form and repeat the enhanced code.
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        let lines: Vec<&str> = if self.message.is_empty() {
            vec![""]
        } else {
            self.message.lines().collect()
        };
        let last = lines.len() - 1;

        lines.into_iter().enumerate().map(move |(i, line)| {
            let separator = if i == last { ' ' } else { '-' };
            match self.code {
                Some(code) => format!("{}{separator}{code} {line}", self.status),
                None => format!("{}{separator}{line}", self.status),
            }
        })
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for line in self.lines() {
            if !first {
                f.write_str("\r\n")?;
            }
            first = false;
            f.write_str(&line)?;
        }
        Ok(())
    }
}

impl From<&EnhancedStatus> for Reply {
    fn from(value: &EnhancedStatus) -> Self {
        value.reply()
    }
}
