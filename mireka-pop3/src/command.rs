use std::fmt::{self, Display, Formatter};

use crate::error::Pop3Error;

const SINGLE_ARGUMENT: &str = "Syntax error: command with exactly one argument is expected";
const OPTIONAL_NUMBER: &str = "Syntax error: Either no argument or a single numeric argument is expected";
const SINGLE_NUMBER: &str = "Syntax error: A single numeric argument is expected";
const TWO_NUMBERS: &str = "Syntax error: Two numeric arguments are expected";
const NO_ARGUMENT: &str = "Syntax error: no argument is expected";

/// A POP3 command line (RFC 1939, RFC 2449).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    User(String),
    Pass(String),
    Stat,
    List(Option<usize>),
    Uidl(Option<usize>),
    Retr(usize),
    Top { message: usize, lines: usize },
    Dele(usize),
    Noop,
    Rset,
    Quit,
    Capa,
}

impl Display for Command {
    /// The command as it may be logged. The password is masked.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(user) => write!(f, "USER {user}"),
            Self::Pass(_) => f.write_str("PASS ****"),
            Self::Stat => f.write_str("STAT"),
            Self::List(None) => f.write_str("LIST"),
            Self::List(Some(number)) => write!(f, "LIST {number}"),
            Self::Uidl(None) => f.write_str("UIDL"),
            Self::Uidl(Some(number)) => write!(f, "UIDL {number}"),
            Self::Retr(number) => write!(f, "RETR {number}"),
            Self::Top { message, lines } => write!(f, "TOP {message} {lines}"),
            Self::Dele(number) => write!(f, "DELE {number}"),
            Self::Noop => f.write_str("NOOP"),
            Self::Rset => f.write_str("RSET"),
            Self::Quit => f.write_str("QUIT"),
            Self::Capa => f.write_str("CAPA"),
        }
    }
}

impl TryFrom<&str> for Command {
    type Error = Pop3Error;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let (name, rest) = match line.split_once(' ') {
            Some((name, rest)) => (name, Some(rest)),
            None => (line, None),
        };
        if name.len() < 3 {
            return Err(Pop3Error::Syntax("Syntax error: command name is too short"));
        }
        if name.len() > 4 {
            return Err(Pop3Error::Syntax("Syntax error: command name is too long"));
        }

        match name.to_ascii_uppercase().as_str() {
            "USER" => Ok(Self::User(single_argument(rest)?.to_string())),
            "PASS" => Ok(Self::Pass(extended_argument(rest)?.to_string())),
            "STAT" => no_arguments(rest).map(|()| Self::Stat),
            "LIST" => optional_number(rest).map(Self::List),
            "UIDL" => optional_number(rest).map(Self::Uidl),
            "RETR" => single_number(rest).map(Self::Retr),
            "DELE" => single_number(rest).map(Self::Dele),
            "TOP" => match numbers(rest, TWO_NUMBERS)?.as_slice() {
                &[message, lines] => Ok(Self::Top { message, lines }),
                _ => Err(Pop3Error::Syntax(TWO_NUMBERS)),
            },
            "NOOP" => no_arguments(rest).map(|()| Self::Noop),
            "RSET" => no_arguments(rest).map(|()| Self::Rset),
            "QUIT" => no_arguments(rest).map(|()| Self::Quit),
            "CAPA" => no_arguments(rest).map(|()| Self::Capa),
            _ => Err(Pop3Error::UnknownCommand),
        }
    }
}

fn is_graphic(argument: &str) -> bool {
    !argument.is_empty() && argument.bytes().all(|b| b.is_ascii_graphic())
}

/// Arguments separated by exactly one space, each printable US-ASCII.
fn arguments(rest: Option<&str>) -> Result<Vec<&str>, Pop3Error> {
    let Some(rest) = rest else {
        return Ok(Vec::new());
    };
    rest.split(' ')
        .map(|argument| {
            if argument.is_empty() {
                Err(Pop3Error::Syntax(
                    "Syntax error: arguments must be separated by a single space character",
                ))
            } else if is_graphic(argument) {
                Ok(argument)
            } else {
                Err(Pop3Error::Syntax(
                    "Syntax error: an argument must consist of printable US-ASCII characters.",
                ))
            }
        })
        .collect()
}

fn no_arguments(rest: Option<&str>) -> Result<(), Pop3Error> {
    if arguments(rest)?.is_empty() {
        Ok(())
    } else {
        Err(Pop3Error::Syntax(NO_ARGUMENT))
    }
}

fn single_argument(rest: Option<&str>) -> Result<&str, Pop3Error> {
    rest.filter(|argument| is_graphic(argument))
        .ok_or(Pop3Error::Syntax(SINGLE_ARGUMENT))
}

/// A single argument which may contain spaces, such as a password.
fn extended_argument(rest: Option<&str>) -> Result<&str, Pop3Error> {
    rest.filter(|argument| {
        !argument.is_empty() && argument.bytes().all(|b| b == b' ' || b.is_ascii_graphic())
    })
    .ok_or(Pop3Error::Syntax(SINGLE_ARGUMENT))
}

fn numbers(rest: Option<&str>, message: &'static str) -> Result<Vec<usize>, Pop3Error> {
    arguments(rest)?
        .into_iter()
        .map(|argument| argument.parse().map_err(|_| Pop3Error::Syntax(message)))
        .collect()
}

fn optional_number(rest: Option<&str>) -> Result<Option<usize>, Pop3Error> {
    match numbers(rest, OPTIONAL_NUMBER)?.as_slice() {
        [] => Ok(None),
        &[number] => Ok(Some(number)),
        _ => Err(Pop3Error::Syntax(OPTIONAL_NUMBER)),
    }
}

fn single_number(rest: Option<&str>) -> Result<usize, Pop3Error> {
    match numbers(rest, SINGLE_NUMBER)?.as_slice() {
        &[number] => Ok(number),
        _ => Err(Pop3Error::Syntax(SINGLE_NUMBER)),
    }
}
