//! Editing the header section of a message. Fields which are not touched
//! are written back byte for byte, the body is never looked at.

use mailparse::{GroupInfo, MailAddr, MailHeader, MailParseError, SingleInfo};
use mireka_common::mail::MailData;

/// Longest encoded text in one RFC 2047 encoded-word, leaving room for
/// `=?UTF-8?Q?` and `?=` within 75 characters.
const ENCODED_TEXT_LENGTH: usize = 63;

/// Folded lines and line ending included.
#[derive(Debug, Clone)]
struct Field {
    name: String,
    raw: Vec<u8>,
}

impl Field {
    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    fn parsed(&self) -> Option<MailHeader<'_>> {
        mailparse::parse_header(&self.raw).ok().map(|(header, _)| header)
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    fields: Vec<Field>,
    /// The empty line and the body.
    rest: Vec<u8>,
}

impl Message {
    #[must_use]
    pub fn parse(data: &MailData) -> Self {
        let section = data.header_section();
        let mut fields: Vec<Field> = Vec::new();

        for line in section.split_inclusive(|&byte| byte == b'\n') {
            match fields.last_mut() {
                Some(field) if matches!(line.first(), Some(b' ' | b'\t')) => {
                    field.raw.extend_from_slice(line);
                }
                _ => {
                    let name = line
                        .iter()
                        .position(|&byte| byte == b':')
                        .map_or(&[][..], |colon| &line[..colon]);
                    fields.push(Field {
                        name: String::from_utf8_lossy(name).trim().to_string(),
                        raw: line.to_vec(),
                    });
                }
            }
        }

        Self {
            fields,
            rest: data[section.len()..].to_vec(),
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field.is(name))
    }

    /// The decoded value of the first field named `name`.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<String> {
        self.fields
            .iter()
            .filter(|field| field.is(name))
            .find_map(Field::parsed)
            .map(|header| header.get_value().trim().to_string())
    }

    /// Every address of every field named `name`.
    pub fn addresses(&self, name: &str) -> Result<Vec<MailAddr>, MailParseError> {
        let mut addresses = Vec::new();
        for field in self.fields.iter().filter(|field| field.is(name)) {
            let (header, _) = mailparse::parse_header(&field.raw)?;
            addresses.extend(mailparse::addrparse_header(&header)?.iter().cloned());
        }
        Ok(addresses)
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|field| !field.is(name));
    }

    /// Replaces the fields named `name` by a single one in the place of the
    /// first, or adds it to the end. `value` must already be encoded.
    pub fn set(&mut self, name: &str, value: &str) {
        let field = Field {
            name: name.to_string(),
            raw: format!("{name}: {value}\r\n").into_bytes(),
        };

        match self.fields.iter().position(|existing| existing.is(name)) {
            Some(first) => {
                self.fields[first] = field;
                let mut index = 0;
                self.fields.retain(|existing| {
                    index += 1;
                    index - 1 == first || !existing.is(name)
                });
            }
            None => self.fields.push(field),
        }
    }

    pub fn set_addresses(&mut self, name: &str, addresses: &[MailAddr]) {
        self.set(name, &render_addresses(addresses));
    }

    #[must_use]
    pub fn into_data(self) -> MailData {
        let mut data = Vec::with_capacity(
            self.fields.iter().map(|field| field.raw.len()).sum::<usize>() + self.rest.len(),
        );
        for field in self.fields {
            data.extend_from_slice(&field.raw);
        }
        data.extend_from_slice(&self.rest);
        MailData::from(data)
    }
}

/// RFC 2047 Q encoding of `text` split into encoded-words.
fn encoded_words(text: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        let mut buffer = [0; 4];
        let encoded: String = match ch {
            ' ' => String::from("_"),
            ch if ch.is_ascii_alphanumeric() => ch.to_string(),
            ch => ch
                .encode_utf8(&mut buffer)
                .bytes()
                .map(|byte| format!("={byte:02X}"))
                .collect(),
        };
        if current.len() + encoded.len() > ENCODED_TEXT_LENGTH {
            words.push(std::mem::take(&mut current));
        }
        current.push_str(&encoded);
    }
    words.push(current);

    words
        .iter()
        .map(|word| format!("=?UTF-8?Q?{word}?="))
        .collect::<Vec<_>>()
        .join("\r\n ")
}

/// An unstructured field value such as a subject.
#[must_use]
pub fn unstructured(text: &str) -> String {
    if text.is_ascii() {
        text.to_string()
    } else {
        encoded_words(text)
    }
}

/// A display name as an RFC 5322 phrase.
fn phrase(text: &str) -> String {
    const SPECIALS: &[u8] = b" !#$%&'*+-/=?^_`{|}~";

    if !text.is_ascii() {
        encoded_words(text)
    } else if text
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || SPECIALS.contains(&byte))
    {
        text.to_string()
    } else {
        format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

fn render_mailbox(mailbox: &SingleInfo) -> String {
    match mailbox.display_name.as_deref() {
        Some(name) if !name.is_empty() => format!("{} <{}>", phrase(name), mailbox.addr),
        _ => mailbox.addr.clone(),
    }
}

fn render_group(group: &GroupInfo) -> String {
    let members: Vec<String> = group.addrs.iter().map(render_mailbox).collect();
    format!("{}: {};", phrase(&group.group_name), members.join(", "))
}

/// An address list, one address per line when there is more than one.
#[must_use]
pub fn render_addresses(addresses: &[MailAddr]) -> String {
    addresses
        .iter()
        .map(|address| match address {
            MailAddr::Single(mailbox) => render_mailbox(mailbox),
            MailAddr::Group(group) => render_group(group),
        })
        .collect::<Vec<_>>()
        .join(",\r\n ")
}
