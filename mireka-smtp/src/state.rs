use std::fmt::{self, Display, Formatter};

use mireka_common::traits::fsm::FiniteStateMachine;

use crate::{
    command::{Command, HeloVariant},
    handler::SessionInfo,
};

/// Where an SMTP session stands with respect to the mail transaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum State {
    #[default]
    Connect,
    /// Greeted with HELO or EHLO and no transaction open.
    Greeted,
    MailFrom,
    /// At least one recipient accepted.
    RcptTo,
    Data,
    Quit,
    /// The command is not valid here. The session keeps its previous state.
    Invalid { reason: &'static str },
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "Connect",
            Self::Greeted => "Greeted",
            Self::MailFrom => "MailFrom",
            Self::RcptTo => "RcptTo",
            Self::Data => "Data",
            Self::Quit => "Quit",
            Self::Invalid { .. } => "Invalid",
        })
    }
}

impl State {
    /// Whether a mail transaction is open.
    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        matches!(self, Self::MailFrom | Self::RcptTo | Self::Data)
    }
}

impl FiniteStateMachine for State {
    type Input = Command;
    type Context = SessionInfo;

    fn transition(self, input: Self::Input, context: &mut Self::Context) -> Self {
        match (self, input) {
            (_, Command::Quit) => Self::Quit,

            (_, Command::Helo(variant)) => {
                context.extended = matches!(variant, HeloVariant::Ehlo(_));
                context.helo = Some(variant.id().to_string());
                Self::Greeted
            }

            // A MAIL inside a transaction ends it and starts a new one.
            (Self::Greeted | Self::MailFrom | Self::RcptTo, Command::MailFrom(..)) => {
                Self::MailFrom
            }
            (Self::Connect, Command::MailFrom(..)) => Self::Invalid {
                reason: "Error: send HELO/EHLO first",
            },

            (Self::MailFrom | Self::RcptTo, Command::RcptTo(_)) => Self::RcptTo,
            (_, Command::RcptTo(_)) => Self::Invalid {
                reason: "Error: need MAIL command",
            },

            (Self::RcptTo, Command::Data) => Self::Data,
            (Self::MailFrom, Command::Data) => Self::Invalid {
                reason: "Error: need RCPT command",
            },
            (_, Command::Data) => Self::Invalid {
                reason: "Error: need MAIL command",
            },

            (Self::Connect, Command::Rset) => Self::Connect,
            (_, Command::Rset) => Self::Greeted,

            (state, _) => state,
        }
    }
}
