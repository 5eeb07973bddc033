//! DMARC policy discovery (RFC 7489 section 6.6.3), limited to the policy
//! the author domain requests. Nothing here verifies SPF or DKIM.

use std::{fmt, str::FromStr, time::Duration};

use async_trait::async_trait;
use hickory_resolver::{
    ResolveError, TokioResolver,
    config::ResolverOpts,
    name_server::TokioConnectionProvider,
    proto::{ProtoErrorKind, op::ResponseCode},
};
use mireka_common::{internal, tracing};
use mireka_tracing::traced;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DmarcError {
    #[error("Invalid DMARC record: {0}")]
    Syntax(String),

    #[error("DMARC lookup of {domain} failed: {reason}")]
    Temporary { domain: String, reason: String },

    #[error("Cannot set up the DNS resolver: {0}")]
    Resolver(String),
}

fn syntax(reason: impl Into<String>) -> DmarcError {
    DmarcError::Syntax(reason.into())
}

/// The `p` tag: what the domain owner asks receivers to do with mail
/// failing DMARC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    None,
    Quarantine,
    Reject,
}

impl FromStr for Policy {
    type Err = DmarcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "quarantine" => Ok(Self::Quarantine),
            "reject" => Ok(Self::Reject),
            other => Err(syntax(format!("unknown policy {other:?}"))),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Quarantine => "quarantine",
            Self::Reject => "reject",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

/// Removes every CRLF followed by whitespace. Anything else outside
/// printable ASCII, spaces and tabs is an error.
fn unfold(text: &str) -> Result<String, DmarcError> {
    let mut unfolded = String::with_capacity(text.len());
    let mut bytes = text.bytes().peekable();
    while let Some(byte) = bytes.next() {
        match byte {
            0x21..=0x7E | b' ' | b'\t' => unfolded.push(char::from(byte)),
            b'\r' if bytes.next() == Some(b'\n') && matches!(bytes.peek(), Some(b' ' | b'\t')) => {}
            other => return Err(syntax(format!("unexpected byte 0x{other:02X}"))),
        }
    }
    Ok(unfolded)
}

const fn is_wsp(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t')
}

const fn is_valchar(byte: u8) -> bool {
    matches!(byte, 0x21..=0x3A | 0x3C..=0x7E)
}

struct Cursor<'a> {
    text: &'a str,
    position: usize,
}

impl<'a> Cursor<'a> {
    const fn new(text: &'a str) -> Self {
        Self { text, position: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.position).copied()
    }

    fn take_while(&mut self, predicate: impl Fn(u8) -> bool) -> &'a str {
        let start = self.position;
        while self.peek().is_some_and(&predicate) {
            self.position += 1;
        }
        &self.text[start..self.position]
    }

    fn eat(&mut self, expected: u8) -> bool {
        let found = self.peek() == Some(expected);
        if found {
            self.position += 1;
        }
        found
    }

    fn expected(&self, what: &str) -> DmarcError {
        syntax(format!("{what} expected at position {} of {:?}", self.position, self.text))
    }

    /// `[FWS] tag-name [FWS] "=" [FWS] tag-value [FWS]`
    fn tag_spec(&mut self) -> Result<Tag, DmarcError> {
        self.take_while(is_wsp);
        if !self.peek().is_some_and(|byte| byte.is_ascii_alphabetic()) {
            return Err(self.expected("tag name"));
        }
        let name = self.take_while(|byte| byte.is_ascii_alphanumeric() || byte == b'_');

        self.take_while(is_wsp);
        if !self.eat(b'=') {
            return Err(self.expected("\"=\""));
        }
        self.take_while(is_wsp);

        let mut value = String::from(self.take_while(is_valchar));
        if value.is_empty() {
            return Err(self.expected("tag value"));
        }
        loop {
            let space = self.take_while(is_wsp);
            let word = self.take_while(is_valchar);
            if word.is_empty() {
                break;
            }
            value.push_str(space);
            value.push_str(word);
        }

        Ok(Tag {
            name: name.to_string(),
            value,
        })
    }
}

/// Parses a tag-value list (RFC 6376 section 3.2) as used by DMARC:
/// `tag-spec *(";" tag-spec) [";"]`.
pub fn parse_tag_list(text: &str) -> Result<Vec<Tag>, DmarcError> {
    let text = unfold(text)?;
    let mut cursor = Cursor::new(&text);

    let mut tags = vec![cursor.tag_spec()?];
    while cursor.eat(b';') {
        cursor.take_while(is_wsp);
        if cursor.peek().is_none() {
            break;
        }
        tags.push(cursor.tag_spec()?);
    }

    if cursor.peek().is_some() {
        return Err(cursor.expected("\";\""));
    }
    Ok(tags)
}

/// The policy of a DMARC record. The record must start with `v=DMARC1`
/// and carry a `p` tag.
pub fn parse_record(record: &str) -> Result<Policy, DmarcError> {
    let tags = parse_tag_list(record)?;

    match tags.first() {
        Some(Tag { name, value }) if name == "v" && value == "DMARC1" => {}
        Some(Tag { name, .. }) if name == "v" => {
            return Err(syntax(format!("unknown DMARC version in {record:?}")));
        }
        _ => return Err(syntax(format!("dmarc-version expected in {record:?}"))),
    }

    tags.iter()
        .find(|tag| tag.name == "p")
        .ok_or_else(|| syntax(format!("no p tag in {record:?}")))?
        .value
        .parse()
}

/// Chooses the policy of `domain` from its TXT records. Records that are
/// not DMARC records are ignored; more than one valid record means no
/// policy at all.
pub fn select_policy<I, S>(domain: &str, records: I) -> Option<Policy>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut selected = None;
    for record in records {
        match parse_record(record.as_ref()) {
            Ok(policy) if selected.is_none() => selected = Some(policy),
            Ok(_) => {
                internal!(level = DEBUG, "{domain} publishes more than one DMARC record, ignoring them");
                return None;
            }
            Err(err) => internal!(level = DEBUG, "Skipping a TXT record of {domain}: {err}"),
        }
    }
    selected
}

/// Where the DMARC policy of a domain comes from.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// `None` if the domain publishes no usable policy.
    async fn policy(&self, domain: &str) -> Result<Option<Policy>, DmarcError>;
}

/// Looks up `_dmarc.<domain>` TXT records with the system's resolver.
#[derive(Debug)]
pub struct DnsPolicySource {
    resolver: TokioResolver,
}

impl DnsPolicySource {
    pub fn new(timeout: Duration) -> Result<Self, DmarcError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|err| DmarcError::Resolver(err.to_string()))?
            .with_options(opts)
            .build();
        Ok(Self { resolver })
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "ms"))]
    async fn records(&self, domain: &str) -> Result<Vec<String>, DmarcError> {
        let name = format!("_dmarc.{}.", domain.trim_end_matches('.'));

        match self.resolver.txt_lookup(name.as_str()).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part))
                        .collect::<String>()
                })
                .collect()),
            Err(err) if is_temporary(&err) => Err(DmarcError::Temporary {
                domain: domain.to_string(),
                reason: err.to_string(),
            }),
            Err(err) => {
                if !err.is_no_records_found() {
                    internal!(level = DEBUG, "No DMARC record for {domain}: {err}");
                }
                Ok(Vec::new())
            }
        }
    }
}

/// Server failures and transport errors may go away; NXDOMAIN, an empty
/// answer or a refused query will not.
fn is_temporary(err: &ResolveError) -> bool {
    match err.proto().map(|proto| proto.kind()) {
        Some(ProtoErrorKind::NoRecordsFound { response_code, .. }) => {
            *response_code == ResponseCode::ServFail
        }
        Some(_) => true,
        None => false,
    }
}

#[async_trait]
impl PolicySource for DnsPolicySource {
    async fn policy(&self, domain: &str) -> Result<Option<Policy>, DmarcError> {
        let records = self.records(domain).await?;
        Ok(select_policy(domain, records))
    }
}
