//! RFC 5321 envelope addresses.
//!
//! The parser accepts the `Path` grammar of RFC 5321 section 4.1.2 and produces
//! typed values: a [`ReversePath`] for `MAIL FROM` and a [`Recipient`] for
//! `RCPT TO`.
//!
//! ```text
//! Reverse-path   = Path / "<>"
//! Forward-path   = Path / "<Postmaster>"
//! Path           = "<" [ A-d-l ":" ] Mailbox ">"
//! Mailbox        = Local-part "@" ( Domain / address-literal )
//! Local-part     = Dot-string / Quoted-string
//! Domain         = sub-domain *("." sub-domain)
//! address-literal = "[" ( IPv4 / "IPv6:" IPv6 / General-address-literal ) "]"
//! ```
//!
//! Domains and local parts keep the spelling the client used for display, but
//! compare and hash case-insensitively.

use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const MAX_PATH: usize = 256;
const MAX_LOCAL_PART: usize = 64;
const MAX_DOMAIN: usize = 255;

pub type Result<T> = std::result::Result<T, AddressError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,
    #[error("Path exceeds {MAX_PATH} octets")]
    PathTooLong,
    #[error("Local-part exceeds {MAX_LOCAL_PART} octets")]
    LocalPartTooLong,
    #[error("Domain exceeds {MAX_DOMAIN} octets")]
    DomainTooLong,
    #[error("Missing opening angle bracket '<'")]
    MissingOpenBracket,
    #[error("Missing closing angle bracket '>'")]
    MissingCloseBracket,
    #[error("Missing '@' separator in mailbox")]
    MissingAtSign,
    #[error("Invalid local-part: {0}")]
    InvalidLocalPart(String),
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),
    #[error("Invalid address literal: {0}")]
    InvalidAddressLiteral(String),
    #[error("Unclosed quoted string in local-part")]
    UnclosedQuotedString,
    #[error("Invalid quoted string: {0}")]
    InvalidQuotedString(String),
}

/// A domain name, compared without regard to ASCII case.
#[derive(Debug, Clone)]
pub struct Domain(String);

impl Domain {
    /// # Errors
    /// If `text` is not a syntactically valid domain.
    pub fn new(text: &str) -> Result<Self> {
        if text.len() > MAX_DOMAIN {
            return Err(AddressError::DomainTooLong);
        }
        validate_domain(text)?;
        Ok(Self(text.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lower-cased form, used as an identity key.
    #[must_use]
    pub fn canonical(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl PartialEq for Domain {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Domain {}

impl Hash for Domain {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_ignore_case(&self.0, state);
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Domain {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// An address literal such as `[192.0.2.1]` or `[IPv6:2001:db8::1]`.
#[derive(Debug, Clone)]
pub struct AddressLiteral {
    spelling: String,
    address: Option<IpAddr>,
}

impl AddressLiteral {
    /// # Errors
    /// If `text` is not a bracketed address literal.
    pub fn new(text: &str) -> Result<Self> {
        let address = parse_address_literal(text)?;
        Ok(Self {
            spelling: text.to_owned(),
            address,
        })
    }

    /// The IP address, unless this is a general (tagged) literal.
    #[must_use]
    pub const fn address(&self) -> Option<IpAddr> {
        self.address
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.spelling
    }
}

impl PartialEq for AddressLiteral {
    fn eq(&self, other: &Self) -> bool {
        match (self.address, other.address) {
            (Some(a), Some(b)) => a == b,
            _ => self.spelling.eq_ignore_ascii_case(&other.spelling),
        }
    }
}

impl Eq for AddressLiteral {}

impl Hash for AddressLiteral {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.address {
            Some(address) => address.hash(state),
            None => hash_ignore_case(&self.spelling, state),
        }
    }
}

impl Display for AddressLiteral {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spelling)
    }
}

/// The part of a mailbox after the `@`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemotePart {
    Domain(Domain),
    Literal(AddressLiteral),
}

impl RemotePart {
    /// Lower-cased form, used as an identity key.
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::Domain(domain) => domain.canonical(),
            Self::Literal(literal) => literal
                .address
                .map_or_else(|| literal.spelling.to_ascii_lowercase(), |ip| ip.to_string()),
        }
    }

    #[must_use]
    pub const fn domain(&self) -> Option<&Domain> {
        match self {
            Self::Domain(domain) => Some(domain),
            Self::Literal(_) => None,
        }
    }
}

impl Display for RemotePart {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(domain) => domain.fmt(f),
            Self::Literal(literal) => literal.fmt(f),
        }
    }
}

impl FromStr for RemotePart {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with('[') {
            AddressLiteral::new(s).map(Self::Literal)
        } else {
            Domain::new(s).map(Self::Domain)
        }
    }
}

/// The part of a mailbox before the `@`, as spelled by the client.
#[derive(Debug, Clone)]
pub struct LocalPart(String);

impl LocalPart {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_postmaster(&self) -> bool {
        self.0.eq_ignore_ascii_case("postmaster")
    }
}

impl PartialEq for LocalPart {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for LocalPart {}

impl Hash for LocalPart {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_ignore_case(&self.0, state);
    }
}

impl Display for LocalPart {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `local-part@remote-part`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mailbox {
    pub local_part: LocalPart,
    pub remote_part: RemotePart,
}

impl Mailbox {
    /// Lower-cased `local@remote`, used as an identity key.
    #[must_use]
    pub fn canonical(&self) -> String {
        format!(
            "{}@{}",
            self.local_part.0.to_ascii_lowercase(),
            self.remote_part.canonical()
        )
    }
}

impl Display for Mailbox {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.remote_part)
    }
}

impl FromStr for Mailbox {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self> {
        parse_mailbox(s.trim())
    }
}

/// An envelope recipient as given in `RCPT TO`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    /// `<Postmaster>` without a domain; keeps the client's spelling.
    GlobalPostmaster(LocalPart),
    /// `postmaster@domain`
    DomainPostmaster(Mailbox),
    Generic(Mailbox),
}

impl Recipient {
    #[must_use]
    pub const fn is_postmaster(&self) -> bool {
        matches!(self, Self::GlobalPostmaster(_) | Self::DomainPostmaster(_))
    }

    #[must_use]
    pub const fn is_global_postmaster(&self) -> bool {
        matches!(self, Self::GlobalPostmaster(_))
    }

    #[must_use]
    pub const fn mailbox(&self) -> Option<&Mailbox> {
        match self {
            Self::GlobalPostmaster(_) => None,
            Self::DomainPostmaster(mailbox) | Self::Generic(mailbox) => Some(mailbox),
        }
    }

    #[must_use]
    pub const fn remote_part(&self) -> Option<&RemotePart> {
        match self.mailbox() {
            Some(mailbox) => Some(&mailbox.remote_part),
            None => None,
        }
    }

    #[must_use]
    pub const fn local_part(&self) -> &LocalPart {
        match self {
            Self::GlobalPostmaster(local) => local,
            Self::DomainPostmaster(mailbox) | Self::Generic(mailbox) => &mailbox.local_part,
        }
    }

    /// Lower-cased form, used as an identity key.
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::GlobalPostmaster(_) => String::from("postmaster"),
            Self::DomainPostmaster(mailbox) | Self::Generic(mailbox) => mailbox.canonical(),
        }
    }

    fn from_mailbox(mailbox: Mailbox) -> Self {
        if mailbox.local_part.is_postmaster() {
            Self::DomainPostmaster(mailbox)
        } else {
            Self::Generic(mailbox)
        }
    }
}

impl Display for Recipient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::GlobalPostmaster(local) => local.fmt(f),
            Self::DomainPostmaster(mailbox) | Self::Generic(mailbox) => mailbox.fmt(f),
        }
    }
}

/// Parses a recipient written without angle brackets, as in configuration.
impl FromStr for Recipient {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self> {
        parse_forward_path(&format!("<{}>", s.trim()))
    }
}

impl Serialize for Recipient {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Recipient {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// The envelope sender from `MAIL FROM`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ReversePath {
    /// `<>`, used by bounces.
    #[default]
    Null,
    Mailbox(Mailbox),
}

impl ReversePath {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub const fn mailbox(&self) -> Option<&Mailbox> {
        match self {
            Self::Null => None,
            Self::Mailbox(mailbox) => Some(mailbox),
        }
    }

    /// The path including angle brackets, as sent in `MAIL FROM:`.
    #[must_use]
    pub fn smtp_text(&self) -> String {
        format!("<{self}>")
    }
}

/// Renders as the bare mailbox, or the empty string for the null path.
impl Display for ReversePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Mailbox(mailbox) => mailbox.fmt(f),
        }
    }
}

/// Parses the bare form: an empty string is the null path.
impl FromStr for ReversePath {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            Ok(Self::Null)
        } else {
            parse_reverse_path(&format!("<{s}>"))
        }
    }
}

impl Serialize for ReversePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReversePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse a reverse-path (`MAIL FROM` argument), either `<mailbox>` or `<>`.
///
/// # Errors
/// If the input is not a valid reverse-path.
pub fn parse_reverse_path(input: &str) -> Result<ReversePath> {
    let trimmed = checked_path(input)?;

    if trimmed == "<>" {
        return Ok(ReversePath::Null);
    }

    parse_path(trimmed).map(ReversePath::Mailbox)
}

/// Parse a forward-path (`RCPT TO` argument), `<mailbox>` or `<Postmaster>`.
///
/// # Errors
/// If the input is not a valid forward-path.
pub fn parse_forward_path(input: &str) -> Result<Recipient> {
    let trimmed = checked_path(input)?;

    let inner = trimmed
        .strip_prefix('<')
        .ok_or(AddressError::MissingOpenBracket)?
        .strip_suffix('>')
        .ok_or(AddressError::MissingCloseBracket)?;
    if inner.eq_ignore_ascii_case("postmaster") {
        return Ok(Recipient::GlobalPostmaster(LocalPart(inner.to_owned())));
    }

    parse_path(trimmed).map(Recipient::from_mailbox)
}

fn checked_path(input: &str) -> Result<&str> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }
    if trimmed.len() > MAX_PATH {
        return Err(AddressError::PathTooLong);
    }

    Ok(trimmed)
}

/// `<mailbox>` or `<@relay,@relay:mailbox>`; the source route is dropped.
fn parse_path(input: &str) -> Result<Mailbox> {
    let content = input
        .strip_prefix('<')
        .ok_or(AddressError::MissingOpenBracket)?
        .strip_suffix('>')
        .ok_or(AddressError::MissingCloseBracket)?;

    let mailbox = source_route_end(content).map_or(content, |colon| &content[colon + 1..]);

    parse_mailbox(mailbox)
}

/// Byte offset of the `:` closing a source route, ignoring address literals.
fn source_route_end(input: &str) -> Option<usize> {
    if !input.starts_with('@') {
        return None;
    }

    let mut in_brackets = false;
    for (i, ch) in input.char_indices() {
        match ch {
            '[' => in_brackets = true,
            ']' => in_brackets = false,
            ':' if !in_brackets => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_mailbox(input: &str) -> Result<Mailbox> {
    let at = unquoted_at(input)?;
    let (local, remote) = (&input[..at], &input[at + 1..]);

    if local.len() > MAX_LOCAL_PART {
        return Err(AddressError::LocalPartTooLong);
    }
    if remote.len() > MAX_DOMAIN {
        return Err(AddressError::DomainTooLong);
    }

    validate_local_part(local)?;

    Ok(Mailbox {
        local_part: LocalPart(local.to_owned()),
        remote_part: remote.parse()?,
    })
}

/// Byte offset of the `@` separating the local part, skipping quoted text.
fn unquoted_at(input: &str) -> Result<usize> {
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, ch) in input.char_indices() {
        match ch {
            '"' if !escaped => in_quotes = !in_quotes,
            '@' if !in_quotes => return Ok(i),
            _ => {}
        }
        escaped = ch == '\\' && !escaped;
    }

    Err(AddressError::MissingAtSign)
}

fn validate_local_part(input: &str) -> Result<()> {
    if input.is_empty() {
        return Err(AddressError::InvalidLocalPart(String::from("empty")));
    }

    if input.starts_with('"') {
        validate_quoted_string(input)
    } else {
        validate_dot_string(input)
    }
}

fn validate_dot_string(input: &str) -> Result<()> {
    for atom in input.split('.') {
        if atom.is_empty() {
            return Err(AddressError::InvalidLocalPart(format!(
                "empty atom in '{input}'"
            )));
        }
        if let Some(ch) = atom.chars().find(|&ch| !is_atext(ch)) {
            return Err(AddressError::InvalidLocalPart(format!(
                "invalid character '{ch}'"
            )));
        }
    }
    Ok(())
}

fn validate_quoted_string(input: &str) -> Result<()> {
    let content = input
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or(AddressError::UnclosedQuotedString)?;

    let mut chars = content.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some(next) if (' '..='~').contains(&next) => {}
                Some(next) => {
                    return Err(AddressError::InvalidQuotedString(format!(
                        "invalid quoted-pair \\{next}"
                    )));
                }
                None => {
                    return Err(AddressError::InvalidQuotedString(String::from(
                        "trailing backslash",
                    )));
                }
            }
        } else if !is_qtext_smtp(ch) {
            return Err(AddressError::InvalidQuotedString(format!(
                "invalid character '{ch}'"
            )));
        }
    }
    Ok(())
}

fn validate_domain(input: &str) -> Result<()> {
    if input.is_empty() {
        return Err(AddressError::InvalidDomain(String::from("empty")));
    }

    input.split('.').try_for_each(validate_subdomain)
}

/// `Let-dig [Ldh-str]`
fn validate_subdomain(label: &str) -> Result<()> {
    let bytes = label.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last))
            if first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric() => {}
        _ => {
            return Err(AddressError::InvalidDomain(format!(
                "label '{label}' must start and end with a letter or digit"
            )));
        }
    }

    if let Some(ch) = label
        .chars()
        .find(|&ch| !ch.is_ascii_alphanumeric() && ch != '-')
    {
        return Err(AddressError::InvalidDomain(format!(
            "invalid character '{ch}' in '{label}'"
        )));
    }

    Ok(())
}

/// Returns the IP address for IPv4 and IPv6 literals, `None` for general ones.
fn parse_address_literal(input: &str) -> Result<Option<IpAddr>> {
    let content = input
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| {
            AddressError::InvalidAddressLiteral(String::from("must be enclosed in brackets"))
        })?;

    if let Ok(v4) = content.parse::<Ipv4Addr>() {
        return Ok(Some(IpAddr::V4(v4)));
    }

    if let Some(v6) = content.strip_prefix("IPv6:") {
        return v6
            .parse::<Ipv6Addr>()
            .map(|ip| Some(IpAddr::V6(ip)))
            .map_err(|_| AddressError::InvalidAddressLiteral(content.to_owned()));
    }

    match content.split_once(':') {
        Some((tag, value))
            if !tag.is_empty()
                && !value.is_empty()
                && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') =>
        {
            Ok(None)
        }
        _ => Err(AddressError::InvalidAddressLiteral(content.to_owned())),
    }
}

const fn is_atext(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(
            ch,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

/// Printable ASCII except backslash and double quote.
const fn is_qtext_smtp(ch: char) -> bool {
    matches!(ch as u32, 32..=33 | 35..=91 | 93..=126)
}

fn hash_ignore_case<H: Hasher>(text: &str, state: &mut H) {
    for byte in text.bytes() {
        state.write_u8(byte.to_ascii_lowercase());
    }
    state.write_u8(0xff);
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn null_reverse_path() {
        assert_eq!(parse_reverse_path("<>").unwrap(), ReversePath::Null);
        assert_eq!(parse_reverse_path(" <> ").unwrap(), ReversePath::Null);
        assert_eq!(ReversePath::Null.to_string(), "");
        assert_eq!(ReversePath::Null.smtp_text(), "<>");
    }

    #[test]
    fn simple_mailbox() {
        let recipient = parse_forward_path("<john@example.com>").unwrap();
        let Recipient::Generic(mailbox) = recipient else {
            panic!("expected a generic recipient");
        };
        assert_eq!(mailbox.local_part.as_str(), "john");
        assert_eq!(
            mailbox.remote_part,
            RemotePart::Domain(Domain::new("example.com").unwrap())
        );
    }

    #[test]
    fn postmaster_variants() {
        assert!(matches!(
            parse_forward_path("<PostMaster>").unwrap(),
            Recipient::GlobalPostmaster(_)
        ));
        assert_eq!(parse_forward_path("<PostMaster>").unwrap().to_string(), "PostMaster");

        let domain = parse_forward_path("<postmaster@example.com>").unwrap();
        assert!(matches!(domain, Recipient::DomainPostmaster(_)));
        assert!(domain.is_postmaster());
        assert!(!domain.is_global_postmaster());
    }

    #[test]
    fn domain_equality_ignores_case() {
        let upper = Domain::new("EXAMPLE.com").unwrap();
        let lower = Domain::new("example.com").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.to_string(), "EXAMPLE.com");

        let set: HashSet<_> = [upper, lower].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn recipient_equality_ignores_case_but_keeps_spelling() {
        let a: Recipient = "John@Example.COM".parse().unwrap();
        let b: Recipient = "john@example.com".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "John@Example.COM");
        assert_eq!(a.canonical(), "john@example.com");
    }

    #[test]
    fn address_literals() {
        let v4 = parse_forward_path("<user@[192.0.2.1]>").unwrap();
        let remote = v4.remote_part().unwrap();
        let RemotePart::Literal(literal) = remote else {
            panic!("expected an address literal");
        };
        assert_eq!(literal.address(), Some("192.0.2.1".parse().unwrap()));

        let v6 = parse_forward_path("<user@[IPv6:2001:db8::1]>").unwrap();
        assert_eq!(v6.remote_part().unwrap().to_string(), "[IPv6:2001:db8::1]");

        assert!(parse_forward_path("<user@[IPv6:nonsense]>").is_err());
    }

    #[test]
    fn quoted_local_part() {
        let recipient = parse_forward_path(r#"<"john smith"@example.com>"#).unwrap();
        assert_eq!(recipient.local_part().as_str(), r#""john smith""#);

        let escaped = parse_forward_path(r#"<"a\"b@c"@example.com>"#).unwrap();
        assert_eq!(escaped.local_part().as_str(), r#""a\"b@c""#);
    }

    #[test]
    fn source_route_is_dropped() {
        let recipient = parse_forward_path("<@relay1.example,@relay2.example:jane@example.com>")
            .unwrap();
        assert_eq!(recipient.to_string(), "jane@example.com");
    }

    #[test]
    fn rejects_malformed_paths() {
        assert_eq!(
            parse_forward_path("john@example.com").unwrap_err(),
            AddressError::MissingOpenBracket
        );
        assert_eq!(
            parse_forward_path("<johnexample.com>").unwrap_err(),
            AddressError::MissingAtSign
        );
        assert!(matches!(
            parse_forward_path("<john..smith@example.com>"),
            Err(AddressError::InvalidLocalPart(_))
        ));
        assert!(matches!(
            parse_reverse_path("<.@example.com>"),
            Err(AddressError::InvalidLocalPart(_))
        ));
        assert!(matches!(
            parse_forward_path("<john@example-.com>"),
            Err(AddressError::InvalidDomain(_))
        ));
        assert!(matches!(
            parse_forward_path("<john@.example.com>"),
            Err(AddressError::InvalidDomain(_))
        ));
    }

    #[test]
    fn length_limits() {
        let long_local = format!("<{}@example.com>", "a".repeat(70));
        assert_eq!(
            parse_forward_path(&long_local).unwrap_err(),
            AddressError::LocalPartTooLong
        );

        let long_path = format!("<{}@example.com>", "a".repeat(300));
        assert_eq!(
            parse_forward_path(&long_path).unwrap_err(),
            AddressError::PathTooLong
        );
    }

    #[test]
    fn serde_uses_display_form() {
        let recipient: Recipient = "Jane@Example.com".parse().unwrap();
        let text = ron::to_string(&recipient).unwrap();
        assert_eq!(text, "\"Jane@Example.com\"");
        let back: Recipient = ron::from_str(&text).unwrap();
        assert_eq!(back, recipient);

        let null: ReversePath = ron::from_str("\"\"").unwrap();
        assert!(null.is_null());
    }
}
