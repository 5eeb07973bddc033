use mireka_common::status::{EnhancedCode, EnhancedStatus};

use super::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub code: u16,
    pub is_last: bool,
    pub message: String,
}

/// A complete, possibly multi-line, reply from a remote server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 400
    }

    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// The RFC 3463 code the server put in front of its first line, if any.
    #[must_use]
    pub fn enhanced_code(&self) -> Option<EnhancedCode> {
        let first = self.lines.first()?;
        let candidate = first.split_ascii_whitespace().next()?;
        let code: EnhancedCode = candidate.parse().ok()?;

        // Only trust it when the class agrees with the reply code.
        (u16::from(code.class) == self.code / 100).then_some(code)
    }

    /// The text of the reply with any enhanced code prefixes removed.
    #[must_use]
    pub fn text(&self) -> String {
        let Some(code) = self.enhanced_code() else {
            return self.message();
        };
        let prefix = code.to_string();

        self.lines
            .iter()
            .map(|line| {
                line.strip_prefix(prefix.as_str())
                    .map_or(line.as_str(), str::trim_start)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The reply as a status that can be recorded, retried on, or reported
    /// in a delivery status notification.
    #[must_use]
    pub fn status(&self) -> EnhancedStatus {
        let code = self
            .enhanced_code()
            .unwrap_or_else(|| EnhancedCode::approximate(self.code));
        EnhancedStatus::new(self.code, code, self.text())
    }

    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the line doesn't match SMTP format.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        let code_str = line
            .get(..3)
            .ok_or_else(|| ClientError::ParseError(format!("Response line too short: '{line}'")))?;
        let code = code_str
            .parse::<u16>()
            .map_err(|_| ClientError::ParseError(format!("Invalid status code: '{code_str}'")))?;

        let is_last = match line.as_bytes().get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(c) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{}'",
                    char::from(*c)
                )));
            }
        };

        Ok(ResponseLine {
            code,
            is_last,
            message: line.get(4..).unwrap_or_default().to_string(),
        })
    }

    /// Parses a complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` if more
    /// data is needed.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the response is malformed.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut lines = Vec::new();
        let mut consumed = 0;
        let mut first_code = None;

        while let Some(end) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let parsed = Self::parse_line(std::str::from_utf8(raw)?)?;
            match first_code {
                Some(code) if code != parsed.code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {code}, got {}",
                        parsed.code
                    )));
                }
                Some(_) => {}
                None => first_code = Some(parsed.code),
            }

            lines.push(parsed.message);

            if parsed.is_last {
                return Ok(Some((Self::new(parsed.code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line() {
        let (response, consumed) = Response::parse_response(b"250 OK\r\n").unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.lines, vec!["OK"]);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn multi_line() {
        let data = b"250-mail.example.com\r\n250-SIZE 10000000\r\n250 HELP\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.lines, vec!["mail.example.com", "SIZE 10000000", "HELP"]);
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn incomplete() {
        assert!(
            Response::parse_response(b"250-mail.example.com\r\n250-SIZE")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn mismatched_codes() {
        assert!(Response::parse_response(b"250-a\r\n251 b\r\n").is_err());
        assert!(Response::parse_line("25").is_err());
        assert!(Response::parse_line("250+x").is_err());
    }

    #[test]
    fn enhanced_status_is_extracted() {
        let response = Response::new(
            550,
            vec![String::from("5.1.1 User unknown"), String::from("5.1.1 Really")],
        );
        assert_eq!(response.enhanced_code(), Some(EnhancedCode::new(5, 1, 1)));
        assert_eq!(response.text(), "User unknown\nReally");
        assert_eq!(response.status().to_string(), "550 5.1.1 User unknown\nReally");
        assert!(response.is_permanent_error());
    }

    #[test]
    fn enhanced_status_is_approximated() {
        let response = Response::new(451, vec![String::from("Try again later")]);
        assert_eq!(response.enhanced_code(), None);
        let status = response.status();
        assert_eq!(status.code, EnhancedCode::new(4, 0, 0));
        assert!(status.should_retry());

        // A class that disagrees with the reply code is ignored.
        let response = Response::new(250, vec![String::from("5.0.0 odd")]);
        assert_eq!(response.enhanced_code(), None);
    }
}
