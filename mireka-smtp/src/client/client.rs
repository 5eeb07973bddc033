use std::{future::Future, net::SocketAddr, time::Duration};

use mireka_common::{incoming, outgoing, tracing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use super::{
    error::{ClientError, Result},
    response::Response,
};

const BUFFER_SIZE: usize = 8192;

/// Replies larger than this are treated as garbage.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// A plain SMTP client connection.
///
/// Every exchange is bounded by a timeout; a remote rejection is returned as
/// a [`Response`], only transport failures are errors.
pub struct SmtpClient {
    stream: TcpStream,
    buffer: Vec<u8>,
    buffer_pos: usize,
    command_timeout: Duration,
    data_timeout: Duration,
}

impl SmtpClient {
    /// # Errors
    ///
    /// Returns an error if the connection fails or is not made within
    /// `timeout`.
    pub async fn connect(address: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ClientError::Timeout("connect"))??;

        tracing::debug!("Connected to {address}");

        Ok(Self {
            stream,
            buffer: vec![0; BUFFER_SIZE],
            buffer_pos: 0,
            command_timeout: Duration::from_secs(60),
            data_timeout: Duration::from_secs(600),
        })
    }

    #[must_use]
    pub const fn with_timeouts(mut self, command: Duration, data: Duration) -> Self {
        self.command_timeout = command;
        self.data_timeout = data;
        self
    }

    /// # Errors
    /// If the socket is no longer connected.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// # Errors
    /// If the socket is no longer connected.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Reads the initial server greeting.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        let timeout = self.command_timeout;
        with_timeout(timeout, "greeting", self.read_response()).await
    }

    /// Sends a raw command line and reads the reply.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        let timeout = self.command_timeout;
        self.exchange(timeout, command).await
    }

    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("HELO {domain}")).await
    }

    /// Sends `MAIL FROM`. `from` is the bare reverse path; an empty string
    /// sends the null path.
    pub async fn mail_from(&mut self, from: &str, size: Option<usize>) -> Result<Response> {
        let command = match size {
            Some(size) => format!("MAIL FROM:<{from}> SIZE={size}"),
            None => format!("MAIL FROM:<{from}>"),
        };
        self.command(&command).await
    }

    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Sends the message content, dot-stuffed and terminated, and reads the
    /// final reply.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<Response> {
        let timeout = self.data_timeout;
        let payload = dot_stuff(data);

        with_timeout(timeout, "message transfer", async {
            outgoing!("<{} bytes of content>", payload.len());
            self.stream.write_all(&payload).await?;
            self.stream.flush().await?;
            self.read_response().await
        })
        .await
    }

    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    pub async fn quit(&mut self, timeout: Duration) -> Result<Response> {
        self.exchange(timeout, "QUIT").await
    }

    async fn exchange(&mut self, timeout: Duration, command: &str) -> Result<Response> {
        let stage = command
            .split([' ', ':'])
            .next()
            .map_or("command", verb_stage);

        with_timeout(timeout, stage, async {
            outgoing!("{command}");
            self.stream.write_all(format!("{command}\r\n").as_bytes()).await?;
            self.stream.flush().await?;
            self.read_response().await
        })
        .await
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let read = self.stream.read(&mut self.buffer[self.buffer_pos..]).await?;
            if read == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            self.buffer_pos += read;
        }
    }
}

fn verb_stage(verb: &str) -> &'static str {
    match verb.to_ascii_uppercase().as_str() {
        "EHLO" | "HELO" => "EHLO",
        "MAIL" => "MAIL FROM",
        "RCPT" => "RCPT TO",
        "DATA" => "DATA",
        "QUIT" => "QUIT",
        "RSET" => "RSET",
        _ => "command",
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    stage: &'static str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| ClientError::Timeout(stage))?
}

/// Applies RFC 5321 4.5.2 transparency and appends the terminating
/// `CRLF.CRLF`. Bare LF line endings are turned into CRLF.
fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 5);
    let mut at_line_start = true;
    let mut previous = 0;

    for &byte in data {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
        previous = byte;
    }

    if !data.is_empty() && !at_line_start {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}
