use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use mireka_common::{
    Signal,
    error::SessionError,
    internal,
    status::{Reply, Status},
    tracing,
};
use mireka_tracing::traced;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast::Receiver,
};

use crate::{
    State,
    command::Command,
    connection::{Connection, Line},
    handler::{SessionInfo, TransactionHandler, TransactionHandlerFactory},
    timeouts::ServerTimeouts,
};

mod events;
mod io;

/// RFC 5321 4.5.3.1.4, with room for the CRLF.
const MAX_COMMAND_LINE: usize = 512;

#[derive(PartialEq, Eq, Debug)]
pub enum Event {
    ConnectionClose,
    ConnectionKeepAlive,
}

pub struct SessionConfig {
    pub banner: Arc<str>,
    /// 0 means unlimited.
    pub max_message_size: usize,
    pub timeouts: ServerTimeouts,
    pub handler: Arc<dyn TransactionHandlerFactory>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("banner", &self.banner)
            .field("max_message_size", &self.max_message_size)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new(handler: Arc<dyn TransactionHandlerFactory>) -> Self {
        Self {
            banner: Arc::from(default_banner()),
            max_message_size: 0,
            timeouts: ServerTimeouts::default(),
            handler,
        }
    }

    #[must_use]
    pub fn with_banner(mut self, banner: impl Into<Arc<str>>) -> Self {
        self.banner = banner.into();
        self
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: ServerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

pub(crate) fn default_banner() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("localhost"))
}

/// One SMTP server conversation with a connected client.
pub struct Session<Stream> {
    pub(super) state: State,
    pub(super) info: SessionInfo,
    pub(super) connection: Connection<Stream>,
    pub(super) transaction: Option<Box<dyn TransactionHandler>>,
    pub(super) max_message_size: usize,
    factory: Arc<dyn TransactionHandlerFactory>,
    timeouts: ServerTimeouts,
    start_time: Instant,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing)]
    pub fn create(stream: Stream, peer: SocketAddr, config: SessionConfig) -> Self {
        tracing::debug!("Config: {config:?}");

        Self {
            state: State::default(),
            info: SessionInfo::new(peer, config.banner),
            connection: Connection::new(stream),
            transaction: None,
            max_message_size: config.max_message_size,
            factory: config.handler,
            timeouts: config.timeouts,
            start_time: Instant::now(),
        }
    }

    const fn timeout_secs(&self) -> u64 {
        match self.state {
            State::Data => self.timeouts.data_block_secs,
            _ => self.timeouts.command_secs,
        }
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip_all, fields(peer = %self.info.peer), ret), timing(precision = "us"))]
    pub async fn run(mut self, mut signal: Receiver<Signal>) -> Result<(), SessionError> {
        internal!("Connected");

        let greeting = Reply::new(
            Status::ServiceReady,
            format!("{} ESMTP mireka", self.info.server_name),
        );
        let result = match self.connection.send(&greeting).await {
            Ok(()) => self.serve(&mut signal).await,
            Err(err) => Err(err.into()),
        };

        self.end_transaction().await;
        internal!("Connection closed");

        result
    }

    async fn serve(&mut self, signal: &mut Receiver<Signal>) -> Result<(), SessionError> {
        loop {
            if self.start_time.elapsed() >= Duration::from_secs(self.timeouts.connection_secs) {
                tracing::warn!(
                    peer = %self.info.peer,
                    max_secs = self.timeouts.connection_secs,
                    "Connection exceeded maximum lifetime, closing"
                );
                self.send(&Reply::new(Status::Unavailable, "Connection lifetime exceeded"))
                    .await?;
                return Err(SessionError::Timeout(self.timeouts.connection_secs));
            }

            let timeout_secs = self.timeout_secs();
            let line = tokio::select! {
                _ = signal.recv() => {
                    self.send(&Reply::new(Status::Unavailable, "Server shutting down")).await?;
                    return Ok(());
                }
                line = tokio::time::timeout(
                    Duration::from_secs(timeout_secs),
                    self.connection.read_line(MAX_COMMAND_LINE),
                ) => line,
            };

            let Ok(line) = line else {
                tracing::warn!(peer = %self.info.peer, state = %self.state, timeout_secs, "Client connection timed out");
                self.send(&Reply::new(Status::Unavailable, "Timeout waiting for client"))
                    .await?;
                return Err(SessionError::Timeout(timeout_secs));
            };

            let event = match line? {
                None => return Ok(()),
                Some(Line::TooLong) => {
                    self.send(&Reply::new(Status::SyntaxError, "Line too long"))
                        .await?;
                    Event::ConnectionKeepAlive
                }
                Some(Line::Complete(line)) => {
                    let command = Command::from(&*String::from_utf8_lossy(&line));
                    self.handle_command(command).await?
                }
            };

            if event == Event::ConnectionClose {
                return Ok(());
            }
        }
    }

    pub(super) async fn send(&mut self, reply: &Reply) -> Result<(), SessionError> {
        self.connection.send(reply).await.map_err(|err| {
            internal!(level = DEBUG, "Failed to send reply: {err}");
            SessionError::Connection(err)
        })
    }

    /// Closes the open transaction, if any.
    pub(super) async fn end_transaction(&mut self) {
        if let Some(mut transaction) = self.transaction.take() {
            transaction.done().await;
        }
    }

    pub(super) fn begin_transaction(&mut self) -> &mut Box<dyn TransactionHandler> {
        self.transaction.insert(self.factory.create(&self.info))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use async_trait::async_trait;
    use mireka_common::{
        mail::MailData,
        status::{EnhancedCode, Reply, Status},
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::command::MailParameters;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Recorded {
        Mail(String),
        Rcpt(String),
        Data(Vec<u8>),
        Done,
    }

    #[derive(Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<Recorded>>>,
    }

    struct RecordingHandler {
        events: Arc<Mutex<Vec<Recorded>>>,
    }

    #[async_trait]
    impl TransactionHandler for RecordingHandler {
        async fn mail_from(&mut self, path: &str, _: &MailParameters) -> Result<(), Reply> {
            self.events.lock().push(Recorded::Mail(path.to_string()));
            if path == "<spammer@example.com>" {
                return Err(Reply::enhanced(
                    Status::Error,
                    EnhancedCode::new(5, 7, 1),
                    "Go away",
                ));
            }
            Ok(())
        }

        async fn rcpt_to(&mut self, path: &str) -> Result<(), Reply> {
            self.events.lock().push(Recorded::Rcpt(path.to_string()));
            if path.starts_with("<unknown") {
                return Err(Reply::enhanced(
                    Status::Error,
                    EnhancedCode::new(5, 1, 1),
                    format!("User unknown {path}"),
                ));
            }
            Ok(())
        }

        async fn data(&mut self, data: MailData) -> Result<(), Reply> {
            self.events.lock().push(Recorded::Data(data.to_vec()));
            Ok(())
        }

        async fn done(&mut self) {
            self.events.lock().push(Recorded::Done);
        }
    }

    impl TransactionHandlerFactory for Recorder {
        fn create(&self, _: &SessionInfo) -> Box<dyn TransactionHandler> {
            Box::new(RecordingHandler {
                events: Arc::clone(&self.events),
            })
        }
    }

    /// Runs a session over an in-memory pipe, feeding it `input` and
    /// returning everything the server wrote.
    async fn converse(input: &str, max_message_size: usize) -> (String, Vec<Recorded>) {
        let recorder = Arc::new(Recorder::default());
        let events = Arc::clone(&recorder.events);

        let (mut client, server): (DuplexStream, DuplexStream) = tokio::io::duplex(1 << 16);
        let session = Session::create(
            server,
            "127.0.0.1:2525".parse().unwrap(),
            SessionConfig::new(recorder)
                .with_banner("mx.example.com")
                .with_max_message_size(max_message_size),
        );

        let (_tx, rx) = tokio::sync::broadcast::channel(1);
        let task = tokio::spawn(session.run(rx));

        client.write_all(input.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();
        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        task.await.unwrap().unwrap();

        let events = events.lock().clone();
        (output, events)
    }

    #[tokio::test]
    async fn full_transaction() {
        let (output, events) = converse(
            "EHLO client.example.org\r\n\
             MAIL FROM:<john@example.org>\r\n\
             RCPT TO:<jane@example.com>\r\n\
             DATA\r\n\
             Subject: hi\r\n\
             \r\n\
             ..leading dot\r\n\
             .\r\n\
             QUIT\r\n",
            0,
        )
        .await;

        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "220 mx.example.com ESMTP mireka");
        assert!(lines[1].starts_with("250-mx.example.com greets client.example.org"));
        assert!(output.contains("250 2.1.0 Ok\r\n"));
        assert!(output.contains("250 2.1.5 Ok\r\n"));
        assert!(output.contains("354 End data with <CR><LF>.<CR><LF>\r\n"));
        assert!(output.contains("250 2.6.0 Message accepted\r\n"));
        assert!(output.ends_with("221 2.0.0 Bye\r\n"));

        assert_eq!(
            events,
            vec![
                Recorded::Mail(String::from("<john@example.org>")),
                Recorded::Rcpt(String::from("<jane@example.com>")),
                Recorded::Data(b"Subject: hi\r\n\r\n.leading dot\r\n".to_vec()),
                Recorded::Done,
            ]
        );
    }

    #[tokio::test]
    async fn rejected_recipient_keeps_transaction() {
        let (output, events) = converse(
            "HELO client\r\n\
             MAIL FROM:<>\r\n\
             RCPT TO:<unknown@example.com>\r\n\
             DATA\r\n\
             RCPT TO:<jane@example.com>\r\n\
             RSET\r\n\
             QUIT\r\n",
            0,
        )
        .await;

        assert!(output.contains("250 mx.example.com says hello to client\r\n"));
        assert!(output.contains("550 5.1.1 User unknown <unknown@example.com>\r\n"));
        assert!(output.contains("503 5.5.1 Error: need RCPT command\r\n"));
        assert!(output.contains("250 2.1.5 Ok\r\n"));
        assert_eq!(events.last(), Some(&Recorded::Done));
        assert_eq!(
            events.iter().filter(|e| **e == Recorded::Done).count(),
            1,
            "done is called once per transaction"
        );
    }

    #[tokio::test]
    async fn second_mail_starts_a_new_transaction() {
        let (output, events) = converse(
            "EHLO client\r\n\
             MAIL FROM:<john@example.org>\r\n\
             RCPT TO:<jane@example.com>\r\n\
             MAIL FROM:<joe@example.org>\r\n\
             DATA\r\n\
             RCPT TO:<jim@example.com>\r\n\
             DATA\r\n\
             Hello\r\n\
             .\r\n\
             QUIT\r\n",
            0,
        )
        .await;

        assert_eq!(output.matches("250 2.1.0 Ok\r\n").count(), 2);
        assert!(output.contains("503 5.5.1 Error: need RCPT command\r\n"));
        assert!(output.contains("250 2.6.0 Message accepted\r\n"));
        assert_eq!(
            events,
            vec![
                Recorded::Mail(String::from("<john@example.org>")),
                Recorded::Rcpt(String::from("<jane@example.com>")),
                Recorded::Done,
                Recorded::Mail(String::from("<joe@example.org>")),
                Recorded::Rcpt(String::from("<jim@example.com>")),
                Recorded::Data(b"Hello\r\n".to_vec()),
                Recorded::Done,
            ]
        );
    }

    #[tokio::test]
    async fn rejected_sender_ends_transaction() {
        let (output, events) = converse(
            "EHLO client\r\n\
             MAIL FROM:<spammer@example.com>\r\n\
             RCPT TO:<jane@example.com>\r\n\
             QUIT\r\n",
            0,
        )
        .await;

        assert!(output.contains("550 5.7.1 Go away\r\n"));
        assert!(output.contains("503 5.5.1 Error: need MAIL command\r\n"));
        assert_eq!(
            events,
            vec![
                Recorded::Mail(String::from("<spammer@example.com>")),
                Recorded::Done,
            ]
        );
    }

    #[tokio::test]
    async fn oversized_message() {
        let (output, events) = converse(
            "EHLO client\r\n\
             MAIL FROM:<a@example.org> SIZE=5000\r\n\
             MAIL FROM:<a@example.org>\r\n\
             RCPT TO:<b@example.org>\r\n\
             DATA\r\n\
             0123456789012345678901234567890123456789\r\n\
             .\r\n\
             QUIT\r\n",
            16,
        )
        .await;

        assert!(output.contains("250-SIZE 16\r\n"));
        assert_eq!(output.matches("552 5.3.4").count(), 2);
        assert!(!events.iter().any(|e| matches!(e, Recorded::Data(_))));
        assert_eq!(events.last(), Some(&Recorded::Done));
    }

    #[tokio::test]
    async fn unknown_and_unsupported_commands() {
        let (output, _) = converse("FOO\r\nSTARTTLS\r\nMAIL FROM:<a@b.c> SIZE=x\r\nNOOP\r\nQUIT\r\n", 0).await;

        assert!(output.contains("500 5.5.2 Syntax error, command unrecognized\r\n"));
        assert!(output.contains("502 5.5.1 Command not implemented\r\n"));
        assert!(output.contains("501 5.5.4 Invalid SIZE parameter 'SIZE=x'\r\n"));
        assert!(output.contains("250 2.0.0 Ok\r\n"));
    }

    #[tokio::test]
    async fn connection_loss_ends_transaction() {
        let (_, events) = converse("EHLO client\r\nMAIL FROM:<a@example.org>\r\n", 0).await;
        assert_eq!(events.last(), Some(&Recorded::Done));
    }

    #[tokio::test]
    async fn shutdown_signal_closes_session() {
        let (mut client, server) = tokio::io::duplex(1024);
        let session = Session::create(
            server,
            "127.0.0.1:2525".parse().unwrap(),
            SessionConfig::new(Arc::new(Recorder::default())).with_banner("mx"),
        );

        let (tx, rx) = tokio::sync::broadcast::channel(1);
        let task = tokio::spawn(session.run(rx));

        let mut greeting = [0; 64];
        let read = client.read(&mut greeting).await.unwrap();
        assert!(greeting[..read].starts_with(b"220 mx"));

        tx.send(Signal::Shutdown).unwrap();
        let mut rest = String::new();
        client.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "421 Server shutting down\r\n");
        assert!(task.await.unwrap().is_ok());
    }
}
