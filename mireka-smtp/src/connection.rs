use mireka_common::{outgoing, status::Reply, tracing};
use mireka_tracing::traced;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 8192;

#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    /// A line without its terminating CRLF.
    Complete(Vec<u8>),
    /// The line exceeded the limit and was discarded.
    TooLong,
}

/// A buffered, line oriented view of a client stream.
pub struct Connection<Stream> {
    stream: Stream,
    buffer: Vec<u8>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Connection<Stream> {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Reads the next LF terminated line. A trailing CR is removed.
    ///
    /// Returns `None` once the peer has closed the stream; a partial final
    /// line is dropped.
    pub async fn read_line(&mut self, limit: usize) -> std::io::Result<Option<Line>> {
        let mut scanned = 0;
        let mut discarding = false;

        loop {
            if let Some(end) = self.buffer[scanned..].iter().position(|&b| b == b'\n') {
                let end = scanned + end;
                let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }

                return Ok(Some(if discarding || line.len() > limit {
                    Line::TooLong
                } else {
                    Line::Complete(line)
                }));
            }

            if self.buffer.len() > limit {
                discarding = true;
                self.buffer.clear();
            }
            scanned = self.buffer.len();

            let mut chunk = [0; READ_CHUNK];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing)]
    pub async fn send(&mut self, reply: &Reply) -> std::io::Result<()> {
        let mut out = String::new();
        for line in reply.lines() {
            outgoing!("{line}");
            out.push_str(&line);
            out.push_str("\r\n");
        }

        self.write(out.as_bytes()).await
    }

    /// Writes preformatted protocol output as is.
    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }
}
