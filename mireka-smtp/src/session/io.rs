use std::time::Duration;

use mireka_common::{error::SessionError, internal, tracing};
use tokio::io::{AsyncRead, AsyncWrite};

use super::Session;
use crate::connection::Line;

/// Longest content line we keep. RFC 5321 allows 1000, but plenty of
/// clients send more.
const MAX_DATA_LINE: usize = 1 << 20;

pub(super) enum Received {
    Content(Vec<u8>),
    TooLarge,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    /// Reads message content up to the terminating `.` line, removing dot
    /// stuffing. Content beyond the size limit is read and dropped so the
    /// session stays in sync with the client.
    ///
    /// Returns `None` if the client went away mid-message.
    pub(super) async fn receive_data(&mut self) -> Result<Option<Received>, SessionError> {
        let timeout = Duration::from_secs(self.timeout_secs());
        let mut content = Vec::new();
        let mut too_large = false;

        loop {
            let line = tokio::time::timeout(timeout, self.connection.read_line(MAX_DATA_LINE))
                .await
                .map_err(|_| {
                    tracing::warn!(peer = %self.info.peer, "Timed out waiting for message content");
                    SessionError::Timeout(timeout.as_secs())
                })??;

            let line = match line {
                None => {
                    internal!(level = DEBUG, "Connection lost during DATA");
                    return Ok(None);
                }
                Some(Line::TooLong) => {
                    too_large = true;
                    continue;
                }
                Some(Line::Complete(line)) => line,
            };

            if line == b"." {
                break;
            }

            let line = line.strip_prefix(b".").unwrap_or(&line);
            if too_large {
                continue;
            }

            content.extend_from_slice(line);
            content.extend_from_slice(b"\r\n");

            if self.max_message_size > 0 && content.len() > self.max_message_size {
                internal!(
                    level = DEBUG,
                    "Message exceeds {} bytes, discarding",
                    self.max_message_size
                );
                too_large = true;
                content = Vec::new();
            }
        }

        Ok(Some(if too_large {
            Received::TooLarge
        } else {
            Received::Content(content)
        }))
    }
}
