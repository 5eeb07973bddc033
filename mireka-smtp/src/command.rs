use std::{
    borrow::Cow,
    fmt::{self, Display, Formatter},
};

use ahash::AHashMap;

/// ESMTP parameters we recognise, mapped to their canonical spelling so the
/// common case needs no allocation for the key.
static KNOWN_PARAMS: phf::Map<&'static str, &'static str> = phf::phf_map! {
    "SIZE" => "SIZE",
    "BODY" => "BODY",
    "AUTH" => "AUTH",
    "RET" => "RET",
    "ENVID" => "ENVID",
    "SMTPUTF8" => "SMTPUTF8",
};

fn normalize_key(key: &str) -> Cow<'static, str> {
    let upper = key.to_ascii_uppercase();
    KNOWN_PARAMS
        .get(upper.as_str())
        .map_or(Cow::Owned(upper), |known| Cow::Borrowed(*known))
}

/// Parameters following the path of a `MAIL FROM` command (RFC 5321 3.3).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MailParameters {
    params: AHashMap<Cow<'static, str>, Option<String>>,
}

impl MailParameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `KEY=value KEY2` style parameters.
    ///
    /// # Errors
    /// A duplicate key, an empty key, or a `SIZE` that is not a positive number.
    pub fn from_params_str(params: &str) -> Result<Self, String> {
        let mut parsed = Self::new();

        for param in params.split_ascii_whitespace() {
            let (key, value) = match param.split_once('=') {
                Some((key, value)) => (key, Some(value.to_string())),
                None => (param, None),
            };

            if key.is_empty() {
                return Err(format!("Invalid parameter '{param}'"));
            }

            let key = normalize_key(key);
            if key == "SIZE" {
                match value.as_deref().map(str::parse::<usize>) {
                    Some(Ok(size)) if size > 0 => {}
                    _ => return Err(format!("Invalid SIZE parameter '{param}'")),
                }
            }

            if parsed.params.contains_key(&key) {
                return Err(format!("Duplicate parameter '{key}'"));
            }
            parsed.params.insert(key, value);
        }

        Ok(parsed)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .get(&*normalize_key(key))
            .and_then(|value| value.as_deref())
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(&*normalize_key(key))
    }

    /// The declared message size, if any.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.get("SIZE").and_then(|size| size.parse().ok())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl Display for MailParameters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.params.keys().collect();
        keys.sort();

        for (i, key) in keys.into_iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match &self.params[key] {
                Some(value) => write!(f, "{key}={value}")?,
                None => write!(f, "{key}")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl HeloVariant {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Ehlo(id) | Self::Helo(id) => id,
        }
    }
}

/// A single command line received from an SMTP client.
///
/// Paths are kept as the client wrote them, angle brackets included; they are
/// parsed by whoever handles the transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(HeloVariant),
    MailFrom(String, MailParameters),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Help,
    Quit,
    /// A known command this server does not offer.
    Unsupported(String),
    /// A known command with malformed arguments.
    BadArguments(String),
    Invalid(String),
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(HeloVariant::Ehlo(id)) => write!(f, "EHLO {id}"),
            Self::Helo(HeloVariant::Helo(id)) => write!(f, "HELO {id}"),
            Self::MailFrom(path, params) if params.is_empty() => write!(f, "MAIL FROM:{path}"),
            Self::MailFrom(path, params) => write!(f, "MAIL FROM:{path} {params}"),
            Self::RcptTo(path) => write!(f, "RCPT TO:{path}"),
            Self::Data => f.write_str("DATA"),
            Self::Rset => f.write_str("RSET"),
            Self::Noop => f.write_str("NOOP"),
            Self::Help => f.write_str("HELP"),
            Self::Quit => f.write_str("QUIT"),
            Self::Unsupported(command) => write!(f, "{command}"),
            Self::BadArguments(reason) => write!(f, "<bad arguments: {reason}>"),
            Self::Invalid(command) => write!(f, "{command}"),
        }
    }
}

/// Case-insensitive prefix strip.
fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    text.get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &text[prefix.len()..])
}

/// Splits `<path> params` into the path and the rest. A path in angle
/// brackets ends at the first `>` outside a quoted string.
fn split_path(text: &str) -> (&str, &str) {
    let text = text.trim_start();

    if text.starts_with('<') {
        let mut quoted = false;
        let mut escaped = false;
        for (i, c) in text.char_indices() {
            match c {
                _ if escaped => escaped = false,
                '\\' if quoted => escaped = true,
                '"' => quoted = !quoted,
                '>' if !quoted => return (&text[..=i], text[i + 1..].trim()),
                _ => {}
            }
        }
        return (text, "");
    }

    text.split_once(char::is_whitespace)
        .map_or((text, ""), |(path, rest)| (path, rest.trim()))
}

impl From<&str> for Command {
    fn from(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let trimmed = line.trim();

        if let Some(rest) = strip_prefix_ci(trimmed, "MAIL FROM:") {
            let (path, params) = split_path(rest);
            if path.is_empty() {
                return Self::BadArguments(String::from("Missing reverse path"));
            }
            return match MailParameters::from_params_str(params) {
                Ok(params) => Self::MailFrom(path.to_string(), params),
                Err(reason) => Self::BadArguments(reason),
            };
        }

        if let Some(rest) = strip_prefix_ci(trimmed, "RCPT TO:") {
            let (path, _) = split_path(rest);
            if path.is_empty() {
                return Self::BadArguments(String::from("Missing forward path"));
            }
            return Self::RcptTo(path.to_string());
        }

        let (verb, argument) = trimmed
            .split_once(' ')
            .map_or((trimmed, ""), |(verb, argument)| (verb, argument.trim()));

        match verb.to_ascii_uppercase().as_str() {
            "EHLO" | "HELO" if argument.is_empty() => {
                Self::BadArguments(format!("{} requires a domain", verb.to_ascii_uppercase()))
            }
            "EHLO" => Self::Helo(HeloVariant::Ehlo(argument.to_string())),
            "HELO" => Self::Helo(HeloVariant::Helo(argument.to_string())),
            "DATA" => Self::Data,
            "RSET" => Self::Rset,
            "NOOP" => Self::Noop,
            "HELP" => Self::Help,
            "QUIT" => Self::Quit,
            "MAIL" | "RCPT" => Self::BadArguments(String::from("Syntax error in parameters")),
            "STARTTLS" | "AUTH" | "VRFY" | "EXPN" | "TURN" | "ETRN" | "BDAT" => {
                Self::Unsupported(verb.to_ascii_uppercase())
            }
            _ => Self::Invalid(line.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn helo_variants() {
        assert_eq!(
            Command::from("EHLO client.example.org"),
            Command::Helo(HeloVariant::Ehlo(String::from("client.example.org")))
        );
        assert_eq!(
            Command::from("helo client"),
            Command::Helo(HeloVariant::Helo(String::from("client")))
        );
        assert!(matches!(Command::from("EHLO"), Command::BadArguments(_)));
    }

    #[test]
    fn mail_from_with_parameters() {
        let Command::MailFrom(path, params) =
            Command::from("mail from:<john@example.com> size=1200 BODY=8BITMIME")
        else {
            panic!("expected MAIL FROM");
        };

        assert_eq!(path, "<john@example.com>");
        assert_eq!(params.size(), Some(1200));
        assert_eq!(params.get("body"), Some("8BITMIME"));
        assert!(params.has("Size"));
        assert_eq!(params.to_string(), "BODY=8BITMIME SIZE=1200");
    }

    #[test]
    fn null_reverse_path() {
        assert_eq!(
            Command::from("MAIL FROM:<>"),
            Command::MailFrom(String::from("<>"), MailParameters::new())
        );
    }

    #[test]
    fn quoted_local_part_keeps_brackets_inside_quotes() {
        assert_eq!(
            Command::from("RCPT TO:<\"a>b\"@example.com>"),
            Command::RcptTo(String::from("<\"a>b\"@example.com>"))
        );
        assert_eq!(
            Command::from("RCPT TO: <jane@example.com>"),
            Command::RcptTo(String::from("<jane@example.com>"))
        );
    }

    #[test]
    fn bad_parameters() {
        assert!(matches!(
            Command::from("MAIL FROM:<a@b.c> SIZE=0"),
            Command::BadArguments(_)
        ));
        assert!(matches!(
            Command::from("MAIL FROM:<a@b.c> SIZE=abc"),
            Command::BadArguments(_)
        ));
        assert!(matches!(
            Command::from("MAIL FROM:<a@b.c> SIZE=10 size=20"),
            Command::BadArguments(_)
        ));
        assert!(matches!(Command::from("MAIL <a@b.c>"), Command::BadArguments(_)));
        assert!(matches!(Command::from("RCPT TO:"), Command::BadArguments(_)));
    }

    #[test]
    fn simple_commands() {
        assert_eq!(Command::from("DATA\r\n"), Command::Data);
        assert_eq!(Command::from("rset"), Command::Rset);
        assert_eq!(Command::from("NOOP ignored"), Command::Noop);
        assert_eq!(Command::from("QUIT"), Command::Quit);
        assert_eq!(Command::from("STARTTLS"), Command::Unsupported(String::from("STARTTLS")));
        assert_eq!(Command::from("FOO bar"), Command::Invalid(String::from("FOO bar")));
    }
}
